//! One INI document kept identical across a fleet.
//!
//! A [ConfigFleet] starts from a blank slate: each member's file is backed up and cleared when
//! the fleet is built. From then on, each mutation is applied to every member and to the fleet's
//! own copy of the sections (its mirror), so the mirror is what every healthy member holds.

use super::{FanOut, Fleet, FleetResult, Member, Members};
use crate::config::Settings;
use crate::connector::Connect;
use crate::document::{ConfigDocument, OpenOptions, Section, Sections};
use crate::error::{Error, Result};
use crate::logger::Log;
use std::fmt;
use std::ops::RangeBounds;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// A value shared by every member, or one value per member.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PerMember<T> {
    All(T),
    Each(Vec<T>),
}

impl<T: Clone> PerMember<T> {
    pub(crate) fn resolve(self, count: usize, what: &str) -> Result<Vec<T>> {
        match self {
            PerMember::All(value) => Ok(vec![value; count]),
            PerMember::Each(values) if values.len() == count => Ok(values),
            PerMember::Each(values) => Err(Error::InvalidInput(format!(
                "got {} {what} for {count} hosts",
                values.len()
            ))),
        }
    }
}

/// A fleet member: one host's document behind a lock.
pub struct ConfigMember {
    host: String,
    document: Mutex<ConfigDocument>,
}

impl ConfigMember {
    pub fn new(document: ConfigDocument) -> Self {
        ConfigMember {
            host: document.host().to_string(),
            document: Mutex::new(document),
        }
    }

    pub async fn document(&self) -> MutexGuard<'_, ConfigDocument> {
        self.document.lock().await
    }
}

impl Member for ConfigMember {
    fn host(&self) -> &str {
        &self.host
    }
}

impl fmt::Debug for ConfigMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigMember")
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

/// A file that has yet to be opened on one host.
struct Pending {
    connector: Arc<dyn Connect>,
    path: String,
    options: OpenOptions,
    log: Log,
}

impl Member for Pending {
    fn host(&self) -> &str {
        self.connector.host()
    }
}

pub struct ConfigFleet {
    fleet: Fleet<ConfigMember>,
    mirror: Sections,
}

impl ConfigFleet {
    /// Builds a fleet from opened documents.
    ///
    /// Documents without a backup are backed up first. Then every document is cleared. A member
    /// that fails either step is left out, with a warning.
    ///
    /// # Errors
    ///
    /// Returns [Error::NumberOfElements] if no member is left.
    pub async fn new(documents: Vec<ConfigDocument>, fan_out: FanOut, log: &Log) -> Result<Self> {
        let log = log.scoped("fleet");
        let members = Members::new(documents.into_iter().map(ConfigMember::new).collect())?;

        let prepared = fan_out
            .run(&members, "prepare", |member| async move {
                let mut document = member.document().await;
                if document.backup_path().is_none() {
                    document.create_backup().await?;
                }
                document.clear().await
            })
            .await;

        let survivors: Vec<_> = members
            .ids()
            .into_iter()
            .zip(members.iter())
            .filter_map(|(id, member)| match prepared.failed.contains_key(&id) {
                true => {
                    log.warning(format!("leaving {id} out of the fleet"));
                    None
                }
                false => Some(member.clone()),
            })
            .collect();

        Ok(ConfigFleet {
            fleet: Fleet::from_members(Members::from_shared(survivors)?, fan_out),
            mirror: Sections::new(),
        })
    }

    /// Opens (creating if needed, and backing up) `paths` over `connectors`, then builds the
    /// fleet with [Self::new]. Hosts whose file can't be opened are left out.
    ///
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] if a [PerMember::Each] doesn't have one value per
    /// connector, and [Error::NumberOfElements] if no member is left.
    pub async fn from_connections(
        connectors: Vec<Arc<dyn Connect>>,
        paths: PerMember<String>,
        sudo_passwords: Option<PerMember<String>>,
        settings: &Settings,
        log: &Log,
    ) -> Result<Self> {
        let count = connectors.len();
        let paths = paths.resolve(count, "paths")?;
        let passwords: Vec<Option<String>> = match sudo_passwords {
            Some(passwords) => passwords
                .resolve(count, "passwords")?
                .into_iter()
                .map(Some)
                .collect(),
            None => vec![None; count],
        };

        let pending: Vec<_> = connectors
            .into_iter()
            .zip(paths)
            .zip(passwords)
            .map(|((connector, path), sudo_password)| Pending {
                connector,
                path,
                options: OpenOptions {
                    create: true,
                    backup: true,
                    sudo_password,
                },
                log: log.clone(),
            })
            .collect();
        let pending = Members::new(pending)?;

        let fan_out = FanOut::new(settings, log);
        let opened = fan_out
            .run(&pending, "open", |p| async move {
                ConfigDocument::open(p.connector.clone(), &p.path, &p.options, &p.log).await
            })
            .await;

        Self::new(opened.succeeded.into_values().collect(), fan_out, log).await
    }

    /// The sections every member is expected to hold.
    pub fn sections(&self) -> &Sections {
        &self.mirror
    }

    pub fn section(&self, name: &str) -> Option<&Section> {
        self.mirror.get(name)
    }

    pub fn value(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.fleet.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fleet.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ConfigMember>> {
        self.fleet.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ConfigMember>> {
        self.fleet.iter()
    }

    /// A new fleet over the members in `range`, starting from this fleet's mirror. Like
    /// [Fleet::slice], the slice has a child of this fleet's cancellation token.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Result<Self> {
        Ok(ConfigFleet {
            fleet: self.fleet.slice(range)?,
            mirror: self.mirror.clone(),
        })
    }

    pub fn remove_member(&mut self, index: usize) -> Result<Arc<ConfigMember>> {
        self.fleet.remove_member(index)
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.fleet.cancellation_token()
    }

    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.fleet.set_cancellation_token(token);
    }

    /// Runs `operation` on every member, then applies `mirror` if at least one member succeeded.
    async fn apply<T, F, Fut>(
        &mut self,
        name: &str,
        operation: F,
        mirror: impl FnOnce(&mut Sections),
    ) -> FleetResult<T>
    where
        T: Send + 'static,
        F: Fn(Arc<ConfigMember>) -> Fut,
        Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    {
        let result = self.fleet.run(name, operation).await;
        if !result.succeeded.is_empty() {
            mirror(&mut self.mirror);
        }
        result
    }

    pub async fn set(&mut self, section: impl Into<String>, entries: Section) -> FleetResult<()> {
        let section = section.into();
        let (name, values) = (section.clone(), entries.clone());
        self.apply(
            "set section",
            move |member| {
                let (section, entries) = (section.clone(), entries.clone());
                async move { member.document().await.set(section, entries).await }
            },
            |mirror| {
                mirror.insert(name, values);
            },
        )
        .await
    }

    /// Removes `section` everywhere and returns what each member held.
    pub async fn delete(&mut self, section: &str) -> FleetResult<Section> {
        let name = section.to_string();
        self.apply(
            "delete section",
            move |member| {
                let section = name.clone();
                async move { member.document().await.delete(&section).await }
            },
            |mirror| {
                mirror.shift_remove(section);
            },
        )
        .await
    }

    pub async fn clear(&mut self) -> FleetResult<()> {
        self.apply(
            "clear",
            |member| async move { member.document().await.clear().await },
            Sections::clear,
        )
        .await
    }

    pub async fn update<I, S>(&mut self, sections: I) -> FleetResult<()>
    where
        I: IntoIterator<Item = (S, Section)>,
        S: Into<String>,
    {
        let sections: Vec<(String, Section)> = sections
            .into_iter()
            .map(|(name, entries)| (name.into(), entries))
            .collect();
        let updated = sections.clone();
        self.apply(
            "update",
            move |member| {
                let sections = sections.clone();
                async move { member.document().await.update(sections).await }
            },
            |mirror| mirror.extend(updated),
        )
        .await
    }

    pub async fn set_value(
        &mut self,
        section: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> FleetResult<()> {
        let (section, key, value) = (section.to_string(), key.into(), value.into());
        let (s, k, v) = (section.clone(), key.clone(), value.clone());
        self.apply(
            "set value",
            move |member| {
                let (section, key, value) = (section.clone(), key.clone(), value.clone());
                async move {
                    member
                        .document()
                        .await
                        .set_value(&section, key, value)
                        .await
                }
            },
            |mirror| {
                mirror.entry(s).or_default().insert(k, v);
            },
        )
        .await
    }

    pub async fn remove_value(&mut self, section: &str, key: &str) -> FleetResult<String> {
        let (s, k) = (section.to_string(), key.to_string());
        self.apply(
            "remove value",
            move |member| {
                let (section, key) = (s.clone(), k.clone());
                async move { member.document().await.remove_value(&section, &key).await }
            },
            |mirror| {
                if let Some(entries) = mirror.get_mut(section) {
                    entries.shift_remove(key);
                }
            },
        )
        .await
    }
}

impl fmt::Debug for ConfigFleet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigFleet")
            .field("fleet", &self.fleet)
            .field("mirror", &self.mirror)
            .finish()
    }
}
