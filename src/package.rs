//! Package management on one host through `apt`.
//!
//! [PackageManager] issues `apt` subcommands through a [Connect] implementation and turns their
//! output into typed records. Mutating operations check the current package listing first, so
//! asking to install something that is already installed is reported instead of passed to `apt`.

use crate::connector::{run_text, sudo_checked, Connect};
use crate::error::{Error, Result};
use crate::logger::Log;
use crate::sanitize::{escape_string, quote};
use chrono::Local;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

pub mod parse;


/// The command that lists configured repositories.
pub const REPOSITORIES_COMMAND: &str =
    "grep --no-filename -r '^deb ' /etc/apt/sources.list /etc/apt/sources.list.d/";

/// The directory that receives the repository file named in
/// [Settings::repository_file](crate::config::Settings::repository_file).
pub const SOURCES_DIR: &str = "/etc/apt/sources.list.d";

/// One line of `apt list` output.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PackageRecord {
    pub name: String,

    /// The repository (or comma-separated repositories) that provide this version, e.g. `jammy`
    /// or `now`.
    pub repository: String,

    pub version: String,

    pub architecture: String,

    /// Status tags from the trailing bracket group, e.g. `installed`, `automatic`, or
    /// `upgradable from: 1.0-1`.
    pub tags: BTreeSet<String>,
}

impl PackageRecord {
    pub fn is_installed(&self) -> bool {
        self.tags.contains("installed")
    }

    pub fn is_upgradable(&self) -> bool {
        self.tags.iter().any(|t| t.starts_with("upgradable"))
    }
}

/// Whether a repository provides binary or source packages.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepositoryKind {
    Deb,
    DebSrc,
}

impl fmt::Display for RepositoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryKind::Deb => write!(f, "deb"),
            RepositoryKind::DebSrc => write!(f, "deb-src"),
        }
    }
}

/// One line of an APT sources file, e.g.
/// `deb [arch=amd64] http://archive.ubuntu.com/ubuntu jammy main universe`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RepositoryEntry {
    pub kind: RepositoryKind,

    /// Options from the bracketed clause, in source order.
    pub options: IndexMap<String, String>,

    pub url: String,

    pub distribution: String,

    pub components: Vec<String>,
}

impl RepositoryEntry {
    /// Whether this entry points at `url`, ignoring a trailing slash.
    pub fn has_url(&self, url: &str) -> bool {
        self.url.trim_end_matches('/') == url.trim_end_matches('/')
    }
}

impl fmt::Display for RepositoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.kind)?;
        if !self.options.is_empty() {
            let options: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| match v.is_empty() {
                    true => k.clone(),
                    false => format!("{k}={v}"),
                })
                .collect();
            write!(f, "[{}] ", options.join(" "))?;
        }
        write!(f, "{} {}", self.url, self.distribution)?;
        for component in &self.components {
            write!(f, " {component}")?;
        }
        Ok(())
    }
}

/// One result of `apt search`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub name: String,
    pub repository: String,
    pub version: String,
    pub architecture: String,
    pub tags: BTreeSet<String>,

    /// The indented description lines, joined with spaces.
    pub description: String,
}

/// The value of one `apt show` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),

    /// A comma-separated field such as `Depends`, split into its items.
    List(Vec<String>),
}

impl FieldValue {
    /// Appends a continuation line. For a [FieldValue::List], the line continues the last item.
    fn continue_with(&mut self, line: &str) {
        let target = match self {
            FieldValue::Text(text) => text,
            FieldValue::List(items) => match items.last_mut() {
                Some(last) => last,
                None => {
                    items.push(line.to_string());
                    return;
                }
            },
        };
        target.push('\n');
        target.push_str(line);
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(text) => Some(text),
            FieldValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            FieldValue::List(items) => Some(items),
            FieldValue::Text(_) => None,
        }
    }
}

/// The fields of `apt show`, in output order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PackageDetails {
    pub fields: IndexMap<String, FieldValue>,
}

impl PackageDetails {
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// The `Depends` list, or an empty slice if the package has no dependencies.
    pub fn depends(&self) -> &[String] {
        self.get("Depends")
            .and_then(FieldValue::as_list)
            .unwrap_or_default()
    }
}

/// The mutating `apt` subcommands that take a list of package names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mutation {
    Install,
    Reinstall,
    Remove,
    Purge,
}

impl Mutation {
    fn verb(self) -> &'static str {
        match self {
            Mutation::Install => "install",
            Mutation::Reinstall => "reinstall",
            Mutation::Remove => "remove",
            Mutation::Purge => "purge",
        }
    }

    /// Whether the subcommand applies to packages that are already installed.
    fn wants_installed(self) -> bool {
        !matches!(self, Mutation::Install)
    }
}

/// Manages packages on one host.
#[derive(Clone)]
pub struct PackageManager {
    connector: Arc<dyn Connect>,

    /// Passed to [Connect::sudo_run]. `None` means the connector's login password.
    sudo_password: Option<String>,

    repository_file: String,

    log: Log,
}

impl PackageManager {
    /// Builds a manager over `connector`. Messages are logged to `log`, scoped to the host.
    pub fn new(connector: Arc<dyn Connect>, log: &Log) -> Self {
        let log = log.scoped(connector.host().to_string());
        PackageManager {
            connector,
            sudo_password: None,
            repository_file: crate::config::Settings::default().repository_file,
            log,
        }
    }

    /// Uses `password` for `sudo` instead of the login password.
    pub fn with_sudo_password(mut self, password: impl Into<String>) -> Self {
        self.sudo_password = Some(password.into());
        self
    }

    /// Sets the file under [SOURCES_DIR] that [Self::add_repository] appends to.
    pub fn with_repository_file(mut self, name: impl Into<String>) -> Self {
        self.repository_file = name.into();
        self
    }

    pub fn connector(&self) -> &Arc<dyn Connect> {
        &self.connector
    }

    pub fn host(&self) -> &str {
        self.connector.host()
    }

    async fn sudo(&self, command: &str) -> Result<()> {
        sudo_checked(&*self.connector, command, self.sudo_password.as_deref()).await?;
        Ok(())
    }

    /// Lists the `deb` repositories configured in `/etc/apt/sources.list` and
    /// `/etc/apt/sources.list.d/`.
    ///
    /// Lines that don't follow the source-line grammar are dropped.
    pub async fn repositories(&self) -> Result<Vec<RepositoryEntry>> {
        let text = run_text(&*self.connector, REPOSITORIES_COMMAND).await?;
        Ok(parse::parse_repositories(&text))
    }

    /// Appends `line` to the repository file, preceded by a timestamped comment.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if `line` isn't a `deb`/`deb-src` line with an `http` or
    /// `https` URL, and [Error::AlreadyExists] if a configured repository has the same URL.
    pub async fn add_repository(&self, line: &str) -> Result<()> {
        let line = line.trim();
        let entry = parse::validate_source_line(line)?;

        if self
            .repositories()
            .await?
            .iter()
            .any(|existing| existing.has_url(&entry.url))
        {
            return Err(Error::AlreadyExists(format!(
                "repository {} on {}",
                entry.url,
                self.host(),
            )));
        }

        let path = format!("{SOURCES_DIR}/{}", self.repository_file);
        let comment = format!(
            "# Added by pardus @ {}",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
        );
        let command = format!(
            "printf '%s\\n' {} {} >> {}",
            quote(&comment)?,
            quote(line)?,
            quote(&path)?,
        );
        self.sudo(&command).await?;
        self.log.notice(format!("added repository {}", entry.url));
        Ok(())
    }

    /// Runs `apt update`.
    pub async fn update(&self) -> Result<()> {
        self.sudo("apt update").await
    }

    /// Runs `apt upgrade`, limited to `name` if given.
    pub async fn upgrade(&self, name: Option<&str>) -> Result<()> {
        let command = match name {
            Some(name) => format!("apt upgrade -y --only-upgrade {}", escape_string(name)?),
            None => "apt upgrade -y".to_string(),
        };
        self.sudo(&command).await
    }

    /// Lists packages. With both flags off, this lists every package `apt` knows about.
    ///
    /// Malformed lines are logged and skipped.
    pub async fn list(&self, installed: bool, upgradeable: bool) -> Result<Vec<PackageRecord>> {
        let mut command = String::from("apt list");
        if installed {
            command.push_str(" --installed");
        }
        if upgradeable {
            command.push_str(" --upgradeable");
        }

        let text = run_text(&*self.connector, &command).await?;
        Ok(parse::parse_list(&text, &self.log))
    }

    /// Installs every package in `names` that isn't installed yet.
    ///
    /// # Errors
    ///
    /// Names that are unknown or already installed are skipped with a warning. If that leaves
    /// nothing to install, this returns [Error::NotFound] without running `apt`.
    pub async fn install<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mutate(Mutation::Install, collect_names(names)).await
    }

    /// Reinstalls every package in `names` that is installed. See [Self::install] for how names
    /// are filtered.
    pub async fn reinstall<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mutate(Mutation::Reinstall, collect_names(names)).await
    }

    /// Removes every package in `names` that is installed. See [Self::install] for how names are
    /// filtered.
    pub async fn remove<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mutate(Mutation::Remove, collect_names(names)).await
    }

    /// Purges every package in `names` that is installed. See [Self::install] for how names are
    /// filtered.
    pub async fn purge<I, S>(&self, names: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.mutate(Mutation::Purge, collect_names(names)).await
    }

    async fn mutate(&self, mutation: Mutation, names: Vec<String>) -> Result<()> {
        let survivors = self.select(mutation, &names).await?;
        let command = format!("apt {} {} -y", mutation.verb(), survivors.join(" "));
        self.sudo(&command).await?;
        self.log.notice(format!(
            "{} finished for {}",
            mutation.verb(),
            survivors.join(", "),
        ));
        Ok(())
    }

    /// Filters `names` against the current listing and sanitizes the survivors.
    async fn select(&self, mutation: Mutation, names: &[String]) -> Result<Vec<String>> {
        let listing: HashMap<String, PackageRecord> = self
            .list(false, false)
            .await?
            .into_iter()
            .map(|record| (record.name.clone(), record))
            .collect();

        let mut seen = HashSet::new();
        let mut survivors = Vec::new();
        for name in names {
            if !seen.insert(name.as_str()) {
                continue;
            }
            match listing.get(name) {
                None => self
                    .log
                    .warning(format!("package `{name}` not found. Skipping")),
                Some(record) if record.is_installed() != mutation.wants_installed() => {
                    let state = match record.is_installed() {
                        true => "already installed",
                        false => "not installed",
                    };
                    self.log.warning(format!(
                        "package `{name}` is {state}. Skipping {}",
                        mutation.verb(),
                    ));
                }
                Some(_) => survivors.push(escape_string(name)?.to_string()),
            }
        }

        if survivors.is_empty() {
            self.log
                .error(format!("no packages left to {}", mutation.verb()));
            return Err(Error::NotFound(format!(
                "no packages left to {} on {}",
                mutation.verb(),
                self.host(),
            )));
        }
        Ok(survivors)
    }

    /// Fails with [Error::NotFound] unless `name` appears in the package listing.
    async fn require_listed<'a>(&self, name: &'a str) -> Result<&'a str> {
        let name = escape_string(name)?;
        if self.list(false, false).await?.iter().any(|p| p.name == name) {
            Ok(name)
        } else {
            Err(Error::NotFound(format!(
                "package `{name}` on {}",
                self.host()
            )))
        }
    }

    /// Runs `apt search` for a package that appears in the listing.
    pub async fn search(&self, name: &str) -> Result<Vec<SearchResult>> {
        let name = self.require_listed(name).await?;
        let text = run_text(&*self.connector, &format!("apt search {name}")).await?;
        Ok(parse::parse_search(&text))
    }

    /// Runs `apt show` for a package that appears in the listing.
    pub async fn show(&self, name: &str) -> Result<PackageDetails> {
        let name = self.require_listed(name).await?;
        let text = run_text(&*self.connector, &format!("apt show {name}")).await?;
        Ok(parse::parse_show(&text, &self.log))
    }
}

impl fmt::Debug for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageManager")
            .field("host", &self.host())
            .field("repository_file", &self.repository_file)
            .finish_non_exhaustive()
    }
}

pub(crate) fn collect_names<I, S>(names: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .map(|name| name.as_ref().to_string())
        .collect()
}
