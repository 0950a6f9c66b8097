//! The error taxonomy shared by every component.
//!
//! Single-host managers return these errors for caller-facing misuse (bad input, a missing target)
//! and for transport failures. Fleet wrappers never propagate them; instead, each member's error
//! is logged and recorded in that member's slot of a [FleetResult].
//!
//! Malformed lines in command output are not errors. Parsers log and drop them.
//!
//! [FleetResult]: crate::fleet::FleetResult

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A specialized [Result](std::result::Result) type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while administering a host.
#[derive(Debug, Error)]
pub enum Error {
    /// The host could not be resolved or reached, authentication failed, or the session has
    /// already been closed.
    #[error("connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// A remote command did not finish within the configured timeout.
    #[error("command on {host} timed out after {after:?}: {command}")]
    Timeout {
        host: String,
        command: String,
        after: Duration,
    },

    /// The operation was abandoned through its cancellation token.
    #[error("operation was cancelled")]
    Cancelled,

    /// The target already exists, e.g. a duplicate repository.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A package or unit was not found, or every requested name was filtered away.
    #[error("not found: {0}")]
    NotFound(String),

    /// A remote file does not exist and creation was not requested.
    #[error("file does not exist: {}", .0.display())]
    FileNotFound(PathBuf),

    /// A value destined for a shell command contained a forbidden character.
    #[error("refusing to pass unsafe value to a shell: {0:?}")]
    Injection(String),

    /// A fleet was constructed (or sliced, or shrunk) to zero members.
    #[error("insufficient number of elements: {0}")]
    NumberOfElements(&'static str),

    /// Input that fails validation, e.g. a malformed repository line.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A mutating remote command exited unsuccessfully.
    #[error("command on {host} exited with {status}: {command}\n{stderr}")]
    Command {
        host: String,
        command: String,
        status: String,
        stderr: String,
    },

    /// A whole document (as opposed to a single output line) could not be parsed.
    #[error("parse error in {source_name}, line {line}: {message}")]
    Parse {
        source_name: String,
        line: usize,
        message: String,
    },

    /// A fan-out task panicked or was aborted before producing a result.
    #[error("task for {member} failed: {reason}")]
    Task { member: String, reason: String },

    /// A settings or inventory file could not be loaded.
    #[error("configuration error: {0:#}")]
    Config(#[source] anyhow::Error),
}

impl Error {
    /// Convenience constructor for [Error::Connection].
    pub fn connection(host: impl Into<String>, reason: impl ToString) -> Self {
        Error::Connection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Returns whether this is an [Error::NotFound].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}
