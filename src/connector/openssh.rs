//! Contains the production [Connect] implementation based on the [openssh] crate.

use super::{sudo_command, Connect, ConnectionInfo};
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::logger::Log;
use async_trait::async_trait;
use openssh::{Session, SessionBuilder, Stdio};
use std::future::Future;
use std::process::Output;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::time;

/// A connection to a remote host via SSH.
///
/// Authentication happens in [SshConnector::connect]; there is no way to hold an unauthenticated
/// [SshConnector]. Commands run over a multiplexed OpenSSH control master, one at a time.
///
/// # Authentication
///
/// [openssh] drives the system `ssh` client in batch mode, so login uses the SSH agent, the
/// default keys, or [ConnectionInfo::identity_file]. [ConnectionInfo::password] authenticates
/// `sudo`. Hosts that only accept password login need a
/// [PasswordConnector](super::PasswordConnector); [connect](super::connect) falls back to one.
///
/// # Closing
///
/// Call [Connect::close] to shut the session down and learn whether that went cleanly. Dropping
/// an open [SshConnector] also tears the session down, but any error is lost.
pub struct SshConnector {
    label: String,

    /// The login password, used for `sudo` when the caller doesn't supply one.
    password: String,

    /// `None` once the session has been closed.
    session: Mutex<Option<Session>>,

    command_timeout: Duration,

    log: Log,
}

impl SshConnector {
    /// Connects and authenticates to the host described by `info`.
    ///
    /// # Errors
    ///
    /// Returns [Error::Connection] if the host can't be resolved or reached, or if authentication
    /// fails, and [Error::Timeout] if this takes longer than [Settings::connect_timeout] (plus
    /// a little slack for `ssh` to report its own timeout first).
    pub async fn connect(info: ConnectionInfo, settings: &Settings, log: &Log) -> Result<Self> {
        let label = info.label();
        let log = log.scoped(label.clone());

        let mut builder = SessionBuilder::default();
        builder
            .user(info.username.clone())
            .port(info.port)
            .known_hosts_check(settings.known_hosts.into())
            .connect_timeout(settings.connect_timeout());
        if let Some(ref key) = info.identity_file {
            builder.keyfile(key);
        }

        log.notice(format!("connecting as {}", info.username));
        let deadline = settings.connect_timeout() + Duration::from_secs(5);
        let session = match time::timeout(deadline, builder.connect_mux(&info.address)).await {
            Ok(Ok(session)) => session,
            Ok(Err(error)) => {
                log.error(format!("failed to connect: {error}"));
                return Err(Error::connection(label, error));
            }
            Err(_) => {
                log.error("timed out while connecting");
                return Err(Error::Timeout {
                    host: label,
                    command: "ssh".to_string(),
                    after: deadline,
                });
            }
        };
        log.notice("connected");

        Ok(SshConnector {
            label,
            password: info.password,
            session: Mutex::new(Some(session)),
            command_timeout: settings.command_timeout(),
            log,
        })
    }

    /// Applies the command timeout to `future` and converts its error.
    async fn timed<F>(&self, command: &str, future: F) -> Result<Output>
    where
        F: Future<Output = std::result::Result<Output, openssh::Error>>,
    {
        match time::timeout(self.command_timeout, future).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(error)) => Err(Error::connection(&self.label, error)),
            Err(_) => {
                self.log
                    .warning(format!("timed out after {:?}", self.command_timeout));
                Err(Error::Timeout {
                    host: self.label.clone(),
                    command: command.to_string(),
                    after: self.command_timeout,
                })
            }
        }
    }

    fn closed(&self) -> Error {
        Error::connection(&self.label, "session is closed")
    }

    /// Runs `command` with `input` on its standard input. Timeouts are reported against `label`.
    ///
    /// Standard output is only drained once all of `input` has been written, so `command` must
    /// not produce much output before it has read its input.
    async fn run_fed(&self, label: &str, command: &str, input: &[u8]) -> Result<Output> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed())?;

        let run = async {
            let mut child = session
                .raw_command(command)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()
                .await?;

            // Dropping stdin afterwards gives the command EOF instead of a stream that never ends.
            if let Some(mut stdin) = child.stdin().take() {
                stdin
                    .write_all(input)
                    .await
                    .map_err(openssh::Error::ChildIo)?;
                stdin.flush().await.map_err(openssh::Error::ChildIo)?;
            }

            // Drains stdout and stderr together, so neither can fill up and stall the other.
            child.wait_with_output().await
        };

        self.timed(label, run).await
    }
}

#[async_trait]
impl Connect for SshConnector {
    fn host(&self) -> &str {
        &self.label
    }

    async fn run(&self, command: &str) -> Result<Output> {
        let guard = self.session.lock().await;
        let session = guard.as_ref().ok_or_else(|| self.closed())?;

        self.timed(command, session.raw_command(command).output())
            .await
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<Output> {
        self.run_fed(command, command, input).await
    }

    async fn sudo_run(&self, command: &str, password: Option<&str>) -> Result<Output> {
        let wrapped = sudo_command(command)?;
        let password = password.unwrap_or(&self.password);

        // sudo reads one line. Log the inner command only; the wrapper is noise.
        self.run_fed(command, &wrapped, format!("{password}\n").as_bytes())
            .await
    }

    async fn close(&self) -> Result<()> {
        let session = self.session.lock().await.take();
        match session {
            Some(session) => {
                self.log.notice("closing session");
                session
                    .close()
                    .await
                    .map_err(|e| Error::connection(&self.label, e))
            }
            None => Ok(()),
        }
    }
}

impl Drop for SshConnector {
    fn drop(&mut self) {
        // Best-effort close: openssh tears down the control master when a Session is dropped.
        if let Some(session) = self.session.get_mut().take() {
            self.log.notice("dropping open session");
            drop(session);
        }
    }
}

impl std::fmt::Debug for SshConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshConnector")
            .field("label", &self.label)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}
