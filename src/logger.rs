//! The logging capability handed to every component at construction.
//!
//! Connectors, managers, and fleets each store a [Log]. Cloning a [Log] is cheap; all clones share
//! one [Logger], the physical mechanism that writes entries somewhere. By default that is
//! [TracingLogger], which forwards to the [tracing] ecosystem and leaves subscriber setup to the
//! embedding application. Tests and user interfaces can swap in a [MemoryLogger] to inspect what
//! happened during a batch operation.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Severity classifications for log entries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogEntry<E> {
    /// Just a status update; nothing's wrong.
    Notice(E),

    /// Something minor went wrong, e.g. a package was skipped or one host in a batch failed, but
    /// the operation is continuing.
    Warning(E),

    /// Something significant went wrong.
    Error(E),
}

impl<E> LogEntry<E> {
    /// Returns the wrapped message regardless of severity.
    pub fn message(&self) -> &E {
        match self {
            LogEntry::Notice(m) | LogEntry::Warning(m) | LogEntry::Error(m) => m,
        }
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, LogEntry::Warning(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, LogEntry::Error(_))
    }
}

impl<E: fmt::Display> fmt::Display for LogEntry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogEntry::Notice(m) => write!(f, "NOTICE: {m}"),
            LogEntry::Warning(m) => write!(f, "WARNING: {m}"),
            LogEntry::Error(m) => write!(f, "ERROR: {m}"),
        }
    }
}

/// An interface to a physical logging mechanism.
///
/// If you're implementing your own logging system, you simply need to implement this trait on your
/// type and wrap it with [Log::new].
pub trait Logger: Send + Sync {
    /// Write a log entry. `target` names the component that produced it, e.g. `web-01` or
    /// `fleet`.
    fn log(&self, target: &str, entry: LogEntry<String>);
}

/// A logging mechanism for use in other parts of the program.
///
/// Clone one of these and store it in your types that need to send log messages.
#[derive(Clone)]
pub struct Log {
    target: Arc<str>,
    sink: Arc<dyn Logger>,
}

impl Log {
    /// Wraps a [Logger] in a new [Log] whose messages are attributed to `target`.
    pub fn new(target: impl Into<Arc<str>>, logger: impl Logger + 'static) -> Self {
        Log {
            target: target.into(),
            sink: Arc::new(logger),
        }
    }

    /// Returns a [Log] that writes to the same sink but attributes messages to `target`.
    ///
    /// Managers use this to tag every message with the host they manage.
    pub fn scoped(&self, target: impl Into<Arc<str>>) -> Self {
        Log {
            target: target.into(),
            sink: self.sink.clone(),
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Sends a notice-level log message.
    pub fn notice(&self, message: impl Into<String>) {
        self.sink.log(&self.target, LogEntry::Notice(message.into()));
    }

    /// Sends a warning-level log message.
    pub fn warning(&self, message: impl Into<String>) {
        self.sink.log(&self.target, LogEntry::Warning(message.into()));
    }

    /// Sends an error-level log message.
    pub fn error(&self, message: impl Into<String>) {
        self.sink.log(&self.target, LogEntry::Error(message.into()));
    }
}

impl Default for Log {
    fn default() -> Self {
        Log::new("pardus", TracingLogger)
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Log").field("target", &self.target).finish()
    }
}

/// The production [Logger]. Forwards entries to [tracing] events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, target: &str, entry: LogEntry<String>) {
        match entry {
            LogEntry::Notice(message) => tracing::info!(host = target, "{message}"),
            LogEntry::Warning(message) => tracing::warn!(host = target, "{message}"),
            LogEntry::Error(message) => tracing::error!(host = target, "{message}"),
        }
    }
}

/// A [Logger] that keeps every entry in memory, in order.
///
/// Clones share the same buffer, so keep one clone and hand another to [Log::new].
#[derive(Clone, Debug, Default)]
pub struct MemoryLogger {
    entries: Arc<Mutex<Vec<(String, LogEntry<String>)>>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a [Log] backed by this logger.
    pub fn log(&self, target: impl Into<Arc<str>>) -> Log {
        Log::new(target, self.clone())
    }

    /// Returns the recorded `(target, entry)` pairs.
    pub fn entries(&self) -> MutexGuard<'_, Vec<(String, LogEntry<String>)>> {
        // A poisoned buffer still holds every entry written before the panic.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the messages of all warning-level entries.
    pub fn warnings(&self) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|(_, e)| e.is_warning())
            .map(|(_, e)| e.message().clone())
            .collect()
    }
}

impl Logger for MemoryLogger {
    fn log(&self, target: &str, entry: LogEntry<String>) {
        self.entries().push((target.to_string(), entry));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_logs_share_a_sink() {
        let memory = MemoryLogger::new();
        let log = memory.log("fleet");
        let host = log.scoped("web-01");

        log.notice("starting");
        host.warning("package `foo` not found");

        let entries = memory.entries();
        assert_eq!(2, entries.len());
        assert_eq!("fleet", entries[0].0);
        assert_eq!(
            ("web-01".to_string(), LogEntry::Warning("package `foo` not found".to_string())),
            entries[1],
        );
    }

    #[test]
    fn displays_severity() {
        assert_eq!("WARNING: hi", LogEntry::Warning("hi").to_string());
        assert_eq!("ERROR: hi", LogEntry::Error("hi").to_string());
    }
}
