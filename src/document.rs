//! Remote configuration files as in-memory documents.
//!
//! A document is opened from a host, and from then on every mutation is written straight back to
//! the remote file. There is no separate save step. If a write fails, the document keeps its
//! previous state, so what you see in memory is always what's on the host.
//!
//! [ConfigDocument] treats the file as INI text (see [ini]); [RawDocument] keeps it verbatim.
//!
//! # Opening
//!
//! 1. Probe for the file. If it's missing and [OpenOptions::create] is set, create it (and its
//!    parent directories); otherwise fail with [Error::FileNotFound].
//! 2. If [OpenOptions::backup] is set, copy the file to the first free `<path>.N`.
//! 3. Read the file.

use crate::connector::Connect;
use crate::error::{Error, Result};
use crate::logger::Log;
use crate::remote_file::RemoteFile;
use indexmap::IndexMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub mod ini;


/// The keys and values of one section, in file order.
pub type Section = IndexMap<String, String>;

/// Every section of a document, in file order.
pub type Sections = IndexMap<String, Section>;

/// Options for opening a document.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpenOptions {
    /// Create the file if it doesn't exist.
    pub create: bool,

    /// Copy the file to a fresh backup before reading it.
    pub backup: bool,

    /// Password for `sudo`. `None` means the connector's login password.
    pub sudo_password: Option<String>,
}

impl OpenOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn backup(mut self, backup: bool) -> Self {
        self.backup = backup;
        self
    }

    pub fn sudo_password(mut self, password: impl Into<String>) -> Self {
        self.sudo_password = Some(password.into());
        self
    }
}

/// Runs the opening protocol and returns the file, the backup path (if any), and the text.
async fn open_file(
    connector: Arc<dyn Connect>,
    path: &str,
    options: &OpenOptions,
    log: &Log,
) -> Result<(RemoteFile, Option<String>, String)> {
    let file = RemoteFile::new(connector, path, options.sudo_password.clone())?;

    if !file.exists().await? {
        if !options.create {
            return Err(Error::FileNotFound(PathBuf::from(path)));
        }
        file.touch().await?;
        log.notice(format!("created {path}"));
    }

    let backup = match options.backup {
        true => {
            let backup = file.create_backup().await?;
            log.notice(format!("backed up {path} to {backup}"));
            Some(backup)
        }
        false => None,
    };

    let text = file.read().await?;
    Ok((file, backup, text))
}

/// An INI file on a remote host.
///
/// Mutations take `&mut self` and write the whole file through before returning.
pub struct ConfigDocument {
    file: RemoteFile,
    sections: Sections,
    backup: Option<String>,
    log: Log,
}

impl ConfigDocument {
    /// Opens and parses the INI file at `path`.
    ///
    /// # Errors
    ///
    /// Besides connection and command errors, this returns [Error::FileNotFound] if the file is
    /// missing and not to be created, and [Error::Parse] if it isn't valid INI.
    pub async fn open(
        connector: Arc<dyn Connect>,
        path: &str,
        options: &OpenOptions,
        log: &Log,
    ) -> Result<Self> {
        let log = log.scoped(connector.host().to_string());
        let (file, backup, text) = open_file(connector, path, options, &log).await?;
        let source_name = format!("{}:{path}", file.host());
        let sections = ini::parse(&text, &source_name)?;

        Ok(ConfigDocument {
            file,
            sections,
            backup,
            log,
        })
    }

    pub fn path(&self) -> &str {
        self.file.path()
    }

    pub fn host(&self) -> &str {
        self.file.host()
    }

    /// The backup made when this document was opened, if one was requested.
    pub fn backup_path(&self) -> Option<&str> {
        self.backup.as_deref()
    }

    /// Copies the remote file to a fresh backup now, and remembers it as [Self::backup_path].
    pub async fn create_backup(&mut self) -> Result<&str> {
        let backup = self.file.create_backup().await?;
        self.log
            .notice(format!("backed up {} to {backup}", self.path()));
        Ok(self.backup.insert(backup).as_str())
    }

    pub fn sections(&self) -> &Sections {
        &self.sections
    }

    pub fn get(&self, section: &str) -> Option<&Section> {
        self.sections.get(section)
    }

    pub fn value(&self, section: &str, key: &str) -> Option<&str> {
        self.get(section)?.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// The document as it is written to the host.
    pub fn to_ini(&self) -> String {
        ini::serialize(&self.sections)
    }

    /// Writes `next` to the host and, if that works, makes it the document's state.
    async fn commit(&mut self, next: Sections) -> Result<()> {
        self.file.write(&ini::serialize(&next)).await?;
        self.log.notice(format!(
            "wrote {} sections to {}",
            next.len(),
            self.path()
        ));
        self.sections = next;
        Ok(())
    }

    /// Replaces (or adds) `section` with `entries`.
    pub async fn set(&mut self, section: impl Into<String>, entries: Section) -> Result<()> {
        let section = section.into();
        check_section(&section, &entries)?;

        let mut next = self.sections.clone();
        next.insert(section, entries);
        self.commit(next).await
    }

    /// Removes `section` and returns its entries.
    ///
    /// # Errors
    ///
    /// Returns [Error::NotFound], without writing, if there is no such section.
    pub async fn delete(&mut self, section: &str) -> Result<Section> {
        let mut next = self.sections.clone();
        let removed = next.shift_remove(section).ok_or_else(|| {
            Error::NotFound(format!("section [{section}] in {}", self.path()))
        })?;
        self.commit(next).await?;
        Ok(removed)
    }

    /// Removes every section, leaving an empty file.
    pub async fn clear(&mut self) -> Result<()> {
        self.commit(Sections::new()).await
    }

    /// Replaces (or adds) every section in `sections` with one write.
    pub async fn update<I, S>(&mut self, sections: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, Section)>,
        S: Into<String>,
    {
        let mut next = self.sections.clone();
        for (name, entries) in sections {
            let name = name.into();
            check_section(&name, &entries)?;
            next.insert(name, entries);
        }
        self.commit(next).await
    }

    /// Sets one key, creating the section if needed.
    pub async fn set_value(
        &mut self,
        section: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<()> {
        let (key, value) = (key.into(), value.into());
        ini::check_entry(section, &key, &value)?;

        let mut next = self.sections.clone();
        next.entry(section.to_string())
            .or_default()
            .insert(key, value);
        self.commit(next).await
    }

    /// Removes one key. The section stays, even if it becomes empty.
    ///
    /// # Errors
    ///
    /// Returns [Error::NotFound], without writing, if there is no such key.
    pub async fn remove_value(&mut self, section: &str, key: &str) -> Result<String> {
        let mut next = self.sections.clone();
        let removed = next
            .get_mut(section)
            .and_then(|entries| entries.shift_remove(key))
            .ok_or_else(|| {
                Error::NotFound(format!("key `{key}` in [{section}] of {}", self.path()))
            })?;
        self.commit(next).await?;
        Ok(removed)
    }
}

impl fmt::Debug for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigDocument")
            .field("file", &self.file)
            .field("sections", &self.sections)
            .field("backup", &self.backup)
            .finish_non_exhaustive()
    }
}

fn check_section(section: &str, entries: &Section) -> Result<()> {
    if entries.is_empty() {
        // An empty section still needs a usable header.
        return ini::check_entry(section, "k", "");
    }
    entries
        .iter()
        .try_for_each(|(key, value)| ini::check_entry(section, key, value))
}

/// A remote file kept as verbatim text.
pub struct RawDocument {
    file: RemoteFile,
    data: String,
    backup: Option<String>,
    log: Log,
}

impl RawDocument {
    /// Opens the file at `path`. See [ConfigDocument::open]; only parsing differs.
    pub async fn open(
        connector: Arc<dyn Connect>,
        path: &str,
        options: &OpenOptions,
        log: &Log,
    ) -> Result<Self> {
        let log = log.scoped(connector.host().to_string());
        let (file, backup, data) = open_file(connector, path, options, &log).await?;
        Ok(RawDocument {
            file,
            data,
            backup,
            log,
        })
    }

    pub fn path(&self) -> &str {
        self.file.path()
    }

    pub fn host(&self) -> &str {
        self.file.host()
    }

    pub fn backup_path(&self) -> Option<&str> {
        self.backup.as_deref()
    }

    pub fn data(&self) -> &str {
        &self.data
    }

    /// Replaces the file's contents.
    pub async fn set_data(&mut self, data: impl Into<String>) -> Result<()> {
        let data = data.into();
        self.file.write(&data).await?;
        self.log
            .notice(format!("wrote {} bytes to {}", data.len(), self.path()));
        self.data = data;
        Ok(())
    }

    /// The length of the contents in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Display for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.data)
    }
}

impl fmt::Debug for RawDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawDocument")
            .field("file", &self.file)
            .field("len", &self.data.len())
            .field("backup", &self.backup)
            .finish_non_exhaustive()
    }
}
