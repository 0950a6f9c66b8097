//! systemd unit control on one host.

use crate::connector::{run_text, sudo_checked, Connect};
use crate::error::{Error, Result};
use crate::logger::Log;
use crate::sanitize::escape_string;
use chrono::{DateTime, FixedOffset};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, OnceLock};

#[cfg(test)]
mod test;

/// Lists every unit, without decoration. `tr` drops everything outside printable ASCII, tab, and
/// line breaks, which removes the status bullets `systemctl` prints before failed units.
pub const LIST_COMMAND: &str =
    r"systemctl list-units -all --no-pager --no-legend | tr -cd '\11\12\15\40-\176'";

/// One row of `systemctl list-units`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServiceRecord {
    pub unit: String,
    pub load: String,
    pub active: String,
    pub sub: String,
    pub description: String,
}

/// One line of a unit's journal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<FixedOffset>,

    /// The host name the journal recorded, which isn't necessarily the address we connected to.
    pub host: String,

    /// The syslog identifier, e.g. `systemd` or `nginx`.
    pub identifier: String,

    pub pid: Option<u32>,

    pub message: String,
}

/// The `systemctl` verbs that act on a single unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitAction {
    Start,
    Stop,
    Restart,
    Enable,
    Disable,
}

impl fmt::Display for UnitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verb = match self {
            UnitAction::Start => "start",
            UnitAction::Stop => "stop",
            UnitAction::Restart => "restart",
            UnitAction::Enable => "enable",
            UnitAction::Disable => "disable",
        };
        f.write_str(verb)
    }
}

/// Manages systemd units on one host.
#[derive(Clone)]
pub struct ServiceManager {
    connector: Arc<dyn Connect>,
    sudo_password: Option<String>,
    log: Log,
}

impl ServiceManager {
    pub fn new(connector: Arc<dyn Connect>, log: &Log) -> Self {
        let log = log.scoped(connector.host().to_string());
        ServiceManager {
            connector,
            sudo_password: None,
            log,
        }
    }

    /// Uses `password` for `sudo` instead of the login password.
    pub fn with_sudo_password(mut self, password: impl Into<String>) -> Self {
        self.sudo_password = Some(password.into());
        self
    }

    pub fn connector(&self) -> &Arc<dyn Connect> {
        &self.connector
    }

    pub fn host(&self) -> &str {
        self.connector.host()
    }

    /// Lists every unit systemd knows about, loaded or not.
    pub async fn list(&self) -> Result<Vec<ServiceRecord>> {
        let text = run_text(&*self.connector, LIST_COMMAND).await?;
        Ok(parse_units(&text, &self.log))
    }

    /// Fails with [Error::NotFound] unless `unit` appears in [Self::list].
    pub async fn check(&self, unit: &str) -> Result<()> {
        if self.list().await?.iter().any(|s| s.unit == unit) {
            Ok(())
        } else {
            Err(Error::NotFound(format!("unit `{unit}` on {}", self.host())))
        }
    }

    /// Runs `systemctl <action> <unit>` as root, after checking that the unit exists.
    pub async fn apply(&self, action: UnitAction, unit: &str) -> Result<()> {
        self.check(unit).await?;
        let unit = escape_string(unit)?;

        let command = format!("systemctl {action} {unit}");
        sudo_checked(&*self.connector, &command, self.sudo_password.as_deref()).await?;
        self.log.notice(format!("{action} {unit}"));
        Ok(())
    }

    pub async fn start(&self, unit: &str) -> Result<()> {
        self.apply(UnitAction::Start, unit).await
    }

    pub async fn stop(&self, unit: &str) -> Result<()> {
        self.apply(UnitAction::Stop, unit).await
    }

    pub async fn restart(&self, unit: &str) -> Result<()> {
        self.apply(UnitAction::Restart, unit).await
    }

    pub async fn enable(&self, unit: &str) -> Result<()> {
        self.apply(UnitAction::Enable, unit).await
    }

    pub async fn disable(&self, unit: &str) -> Result<()> {
        self.apply(UnitAction::Disable, unit).await
    }

    /// Returns the unit's journal for the current boot, oldest first.
    ///
    /// Lines that don't look like journal entries, such as `-- No entries --`, are dropped.
    pub async fn logs(&self, unit: &str) -> Result<Vec<LogEntry>> {
        self.check(unit).await?;
        let unit = escape_string(unit)?;

        let command = format!("journalctl -u {unit} -b -o short-iso");
        let text = run_text(&*self.connector, &command).await?;
        Ok(parse_journal(&text))
    }
}

impl fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceManager")
            .field("host", &self.host())
            .finish_non_exhaustive()
    }
}

/// Parses `systemctl list-units --no-legend` output.
///
/// Each row has four whitespace-separated columns (unit, load, active, sub) followed by a
/// free-text description. Shorter rows are logged and skipped.
pub fn parse_units(text: &str, log: &Log) -> Vec<ServiceRecord> {
    let mut records = Vec::new();

    for row in text.lines() {
        // The remote `tr` already does this; repeat it in case the output came from elsewhere.
        let row: String = row
            .chars()
            .filter(|c| c.is_ascii_graphic() || *c == ' ' || *c == '\t')
            .collect();
        if row.trim().is_empty() {
            continue;
        }

        let mut columns = row.split_whitespace();
        let (Some(unit), Some(load), Some(active), Some(sub)) =
            (columns.next(), columns.next(), columns.next(), columns.next())
        else {
            log.warning(format!("skipping short unit row: {row:?}"));
            continue;
        };

        records.push(ServiceRecord {
            unit: unit.to_string(),
            load: load.to_string(),
            active: active.to_string(),
            sub: sub.to_string(),
            description: columns.collect::<Vec<_>>().join(" "),
        });
    }
    records
}

fn journal_line() -> &'static Regex {
    static COMPUTED: OnceLock<Regex> = OnceLock::new();
    COMPUTED.get_or_init(|| {
        Regex::new(concat!(
            r"^(?P<timestamp>\d{4}-\d{2}-\d{2}T[\d:.]+(?:Z|[+-]\d{2}:?\d{2}))\s+",
            r"(?P<host>\S+)\s+",
            r"(?P<identifier>[^\s\[:]+)(?:\[(?P<pid>\d+)\])?:\s*",
            r"(?P<message>.*)$",
        ))
        .expect("journal line regex is valid")
    })
}

/// Parses a `short-iso` timestamp. Older journald versions print the offset without a colon
/// (`+0800`), which isn't RFC 3339.
fn parse_timestamp(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(text)
        .or_else(|_| DateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%z"))
        .ok()
}

/// Parses one `journalctl -o short-iso` line.
pub fn parse_journal_line(line: &str) -> Option<LogEntry> {
    let captures = journal_line().captures(line.trim_end())?;
    Some(LogEntry {
        timestamp: parse_timestamp(&captures["timestamp"])?,
        host: captures["host"].to_string(),
        identifier: captures["identifier"].to_string(),
        pid: captures.name("pid").and_then(|p| p.as_str().parse().ok()),
        message: captures["message"].to_string(),
    })
}

/// Parses `journalctl -o short-iso` output, keeping journal order. Non-matching lines are
/// dropped.
pub fn parse_journal(text: &str) -> Vec<LogEntry> {
    text.lines().filter_map(parse_journal_line).collect()
}
