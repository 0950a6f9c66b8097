//! Settings and host inventory.
//!
//! Both live in YAML files under [config_dir]: `settings.yaml` tunes timeouts, concurrency, and SSH
//! host key checking; `inventory.yaml` lists the hosts to manage. Every settings field has a
//! default, so an empty or missing settings file is fine.
//!
//! ```yaml
//! # settings.yaml
//! command_timeout: 300
//! operation_timeout: 1800
//! connect_timeout: 10
//! concurrency: 8
//! known_hosts: add
//! ```
//!
//! ```yaml
//! # inventory.yaml
//! web-01:
//!   address: 10.0.0.11
//!   user: admin
//!   password: hunter2
//! web-02:
//!   address: 10.0.0.12
//!   port: 2222
//!   user: admin
//!   password: hunter2
//!   identity_file: ~/.ssh/fleet_ed25519
//! ```

use crate::connector::{ConnectionInfo, DEFAULT_PORT};
use crate::error::{Error, Result};
use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The name of the settings file within [config_dir].
pub const SETTINGS_FILE: &str = "settings.yaml";

/// The name of the inventory file within [config_dir].
pub const INVENTORY_FILE: &str = "inventory.yaml";

/// Returns a [PathBuf] to the directory where pardus's configuration should live.
///
/// When compiled for testing, this returns `CARGO_MANIFEST_DIR` plus `resources/etc/pardus`.
/// Otherwise, it returns `/etc/pardus`.
pub fn config_dir() -> PathBuf {
    // Omit the leading slash so that PathBuf::push appends instead of replacing.
    const CONFIG_DIR: &str = "etc/pardus";

    #[cfg(test)]
    let mut path = {
        let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        path.push("resources");
        path
    };

    #[cfg(not(test))]
    let mut path = PathBuf::from("/");

    path.push(CONFIG_DIR);
    path
}

/// How to treat SSH host keys. Mirrors OpenSSH's `StrictHostKeyChecking`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KnownHostsPolicy {
    /// Refuse hosts whose key is unknown or changed.
    Strict,

    /// Accept and remember unknown hosts; refuse changed keys.
    #[default]
    Add,

    /// Accept any key. Only for throwaway test machines.
    Accept,
}

#[cfg(feature = "openssh")]
impl From<KnownHostsPolicy> for openssh::KnownHosts {
    fn from(value: KnownHostsPolicy) -> Self {
        match value {
            KnownHostsPolicy::Strict => openssh::KnownHosts::Strict,
            KnownHostsPolicy::Add => openssh::KnownHosts::Add,
            KnownHostsPolicy::Accept => openssh::KnownHosts::Accept,
        }
    }
}

/// Tunables shared by connectors and fleets.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Seconds a single remote command may run before it is abandoned. `apt upgrade` on a slow
    /// mirror can take a while, so the default is generous.
    pub command_timeout: u64,

    /// Seconds one host may spend on its part of a fleet operation, across all the commands that
    /// operation runs.
    pub operation_timeout: u64,

    /// Seconds to wait for SSH to establish a session.
    pub connect_timeout: u64,

    /// The maximum number of hosts a fleet operation works on at once.
    pub concurrency: usize,

    pub known_hosts: KnownHostsPolicy,

    /// The file under `/etc/apt/sources.list.d/` that receives repositories added with
    /// [PackageManager::add_repository](crate::package::PackageManager::add_repository).
    pub repository_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            command_timeout: 600,
            operation_timeout: 1800,
            connect_timeout: 10,
            concurrency: 8,
            known_hosts: KnownHostsPolicy::default(),
            repository_file: "pardus.list".to_string(),
        }
    }
}

impl Settings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Parses settings from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        // serde_yaml rejects an empty document, but an empty settings file just means "defaults".
        if yaml.trim().is_empty() {
            return Ok(Settings::default());
        }
        let settings: Settings = serde_yaml::from_str(yaml)
            .context("failed to parse settings")
            .map_err(Error::Config)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml(&read(path.as_ref())?)
    }

    /// Loads `settings.yaml` from [config_dir], falling back to defaults if it doesn't exist.
    pub fn load_default() -> Result<Self> {
        let path = config_dir().join(SETTINGS_FILE);
        match path.try_exists() {
            Ok(true) => Self::load(path),
            Ok(false) => Ok(Settings::default()),
            Err(err) => Err(Error::Config(
                anyhow::Error::new(err).context(format!("failed to stat {}", path.display())),
            )),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config(anyhow::anyhow!(
                "concurrency must be at least 1"
            )));
        }
        if self.command_timeout == 0 {
            return Err(Error::Config(anyhow::anyhow!(
                "command_timeout must be at least 1 second"
            )));
        }
        if self.operation_timeout == 0 {
            return Err(Error::Config(anyhow::anyhow!(
                "operation_timeout must be at least 1 second"
            )));
        }
        crate::sanitize::escape_string(&self.repository_file).map_err(|_| {
            Error::Config(anyhow::anyhow!(
                "repository_file must be a plain file name: {:?}",
                self.repository_file,
            ))
        })?;
        Ok(())
    }
}

/// One host in an [Inventory].
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct HostEntry {
    pub address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub user: String,

    pub password: String,

    /// Path to an SSH private key. A leading `~/` refers to the controller user's home directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl std::fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEntry")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// The hosts to manage, keyed by a name of the operator's choosing.
///
/// Order is preserved from the source file, and fleets built from an inventory keep that order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Inventory {
    pub hosts: IndexMap<String, HostEntry>,
}

impl Inventory {
    /// Parses an inventory from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .context("failed to parse inventory")
            .map_err(Error::Config)
    }

    /// Loads an inventory from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_yaml(&read(path.as_ref())?)
    }

    /// Returns one [ConnectionInfo] per host, in inventory order.
    ///
    /// Fails if an `identity_file` starts with `~/` and the home directory can't be determined.
    pub fn connection_infos(&self) -> Result<Vec<ConnectionInfo>> {
        self.hosts
            .values()
            .map(|entry| {
                let identity_file = match &entry.identity_file {
                    Some(path) => Some(expand_home(path)?),
                    None => None,
                };
                Ok(ConnectionInfo {
                    address: entry.address.clone(),
                    port: entry.port,
                    username: entry.user.clone(),
                    password: entry.password.clone(),
                    identity_file,
                })
            })
            .collect()
    }
}

/// Expands a leading `~/` to the current user's home directory.
fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let mut expanded = home::home_dir().ok_or_else(|| {
                Error::Config(anyhow::anyhow!(
                    "cannot expand {path}: home directory is unknown"
                ))
            })?;
            expanded.push(rest);
            Ok(expanded)
        }
        None => Ok(PathBuf::from(path)),
    }
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))
        .map_err(Error::Config)
}
