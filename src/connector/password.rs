//! Contains a [Connect] implementation that logs in with the account password, based on the
//! [russh] crate.

use super::{sudo_command, Connect, ConnectionInfo};
use crate::config::{KnownHostsPolicy, Settings};
use crate::error::{Error, Result};
use crate::logger::Log;
use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::keys::known_hosts::learn_known_hosts;
use russh::keys::{check_known_hosts, PublicKey};
use russh::{ChannelMsg, Disconnect};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time;

/// The exit code reported for a command killed by a signal, as the OpenSSH client does.
const SIGNALLED: i32 = 255;

/// Checks the server's host key against `~/.ssh/known_hosts` according to a [KnownHostsPolicy].
struct HostKeyCheck {
    address: String,
    port: u16,
    policy: KnownHostsPolicy,
}

impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy {
            KnownHostsPolicy::Accept => Ok(true),
            KnownHostsPolicy::Strict => Ok(check_known_hosts(&self.address, self.port, key)?),
            KnownHostsPolicy::Add => {
                // A changed key is an error here, not `false`.
                if !check_known_hosts(&self.address, self.port, key)? {
                    learn_known_hosts(&self.address, self.port, key)?;
                }
                Ok(true)
            }
        }
    }
}

/// A connection to a remote host via SSH, authenticated with the account password.
///
/// Like [SshConnector](super::SshConnector), a [PasswordConnector] only exists once login has
/// succeeded, and runs one command at a time. Each command gets its own session channel.
pub struct PasswordConnector {
    label: String,

    password: String,

    /// `None` once the session has been closed.
    handle: Mutex<Option<Handle<HostKeyCheck>>>,

    command_timeout: Duration,

    log: Log,
}

impl PasswordConnector {
    /// Connects to the host described by `info` and logs in with [ConnectionInfo::password].
    ///
    /// # Errors
    ///
    /// Returns [Error::Connection] if the host can't be reached, its host key is rejected, or the
    /// password is refused, and [Error::Timeout] if this takes longer than
    /// [Settings::connect_timeout].
    pub async fn connect(info: ConnectionInfo, settings: &Settings, log: &Log) -> Result<Self> {
        let label = info.label();
        let log = log.scoped(label.clone());

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(settings.command_timeout()),
            ..Default::default()
        });
        let check = HostKeyCheck {
            address: info.address.clone(),
            port: info.port,
            policy: settings.known_hosts,
        };

        log.notice(format!("connecting as {} with a password", info.username));
        let login = async {
            let mut handle =
                client::connect(config, (info.address.as_str(), info.port), check).await?;
            let auth = handle
                .authenticate_password(info.username.as_str(), info.password.as_str())
                .await?;
            Ok::<_, russh::Error>((handle, auth.success()))
        };

        let deadline = settings.connect_timeout();
        let handle = match time::timeout(deadline, login).await {
            Ok(Ok((handle, true))) => handle,
            Ok(Ok((_, false))) => {
                log.error("password was rejected");
                return Err(Error::connection(label, "authentication failed"));
            }
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

        Ok(PasswordConnector {
            label,
            password: info.password,
            handle: Mutex::new(Some(handle)),
            command_timeout: settings.command_timeout(),
            log,
        })
    }

    fn closed(&self) -> Error {
        Error::connection(&self.label, "session is closed")
    }

    /// Runs `command` on a fresh channel, sending `input` and then EOF. Timeouts are reported
    /// against `label`.
    async fn exec(&self, label: &str, command: &str, input: &[u8]) -> Result<Output> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| self.closed())?;

        let run = async {
            let mut channel = handle.channel_open_session().await?;
            channel.exec(true, command).await?;
            if !input.is_empty() {
                channel.data(input).await?;
            }
            channel.eof().await?;

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            let mut code = None;
            while let Some(message) = channel.wait().await {
                match message {
                    ChannelMsg::Data { data } => stdout.extend_from_slice(&data),
                    // Extended data type 1 is stderr.
                    ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                    ChannelMsg::ExitStatus { exit_status } => {
                        code = Some(i32::try_from(exit_status).unwrap_or(SIGNALLED));
                    }
                    ChannelMsg::ExitSignal { .. } => code = Some(SIGNALLED),
                    _ => {}
                }
            }
            Ok::<_, russh::Error>((code, stdout, stderr))
        };

        match time::timeout(self.command_timeout, run).await {
            Ok(Ok((Some(code), stdout, stderr))) => Ok(Output {
                // from_raw takes a wait status, which stores the exit code in the second byte.
                status: ExitStatus::from_raw(code << 8),
                stdout,
                stderr,
            }),
            Ok(Ok((None, ..))) => Err(Error::connection(
                &self.label,
                "channel closed without an exit status",
            )),
            Ok(Err(error)) => Err(Error::connection(&self.label, error)),
            Err(_) => {
                self.log
                    .warning(format!("timed out after {:?}", self.command_timeout));
                Err(Error::Timeout {
                    host: self.label.clone(),
                    command: label.to_string(),
                    after: self.command_timeout,
                })
            }
        }
    }
}

#[async_trait]
impl Connect for PasswordConnector {
    fn host(&self) -> &str {
        &self.label
    }

    async fn run(&self, command: &str) -> Result<Output> {
        self.exec(command, command, &[]).await
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<Output> {
        self.exec(command, command, input).await
    }

    async fn sudo_run(&self, command: &str, password: Option<&str>) -> Result<Output> {
        let wrapped = sudo_command(command)?;
        let password = password.unwrap_or(&self.password);
        self.exec(command, &wrapped, format!("{password}\n").as_bytes())
            .await
    }

    async fn close(&self) -> Result<()> {
        let handle = self.handle.lock().await.take();
        match handle {
            Some(handle) => {
                self.log.notice("closing session");
                handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await
                    .map_err(|e| Error::connection(&self.label, e))
            }
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for PasswordConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordConnector")
            .field("label", &self.label)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}
