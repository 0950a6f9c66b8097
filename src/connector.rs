//! The command channel to a single managed host.
//!
//! Everything else in this crate talks to hosts through the [Connect] trait. There are two
//! production implementations: [SshConnector], built on the [openssh] crate, logs in with keys;
//! [PasswordConnector], built on [russh], logs in with the account password. [connect] picks
//! between them. Tests use [FakeConnector](crate::testing::FakeConnector).
//!
//! # Privilege elevation
//!
//! [Connect::sudo_run] runs a command as root by wrapping it as
//! `sudo -S -p '' su -c '<command>'` and writing the password, followed by a newline, to the
//! command's standard input. See [sudo_command].
//!
//! # Standard error
//!
//! Implementations must not read standard error only after standard output has been fully
//! consumed (or vice versa): a remote command that fills the stream you aren't reading will block
//! forever. [SshConnector] drains both streams concurrently and returns both in the [Output].
//!
//! # Standard input
//!
//! Command lines are bounded by the remote kernel's argument size limit, so bulk data such as
//! file contents must travel on standard input through [Connect::run_with_input] instead.
//!
//! [openssh]: https://docs.rs/openssh
//! [russh]: https://docs.rs/russh

use crate::error::{Error, Result};
use crate::sanitize;
use async_trait::async_trait;
use std::fmt;
use std::path::PathBuf;
use std::process::Output;

#[cfg(all(feature = "openssh", feature = "password-login"))]
use crate::{config::Settings, logger::Log};
#[cfg(all(feature = "openssh", feature = "password-login"))]
use std::sync::Arc;

#[cfg(feature = "openssh")]
pub mod openssh;

#[cfg(feature = "password-login")]
pub mod password;

#[cfg(feature = "openssh")]
#[doc(inline)]
pub use self::openssh::SshConnector;

#[cfg(feature = "password-login")]
#[doc(inline)]
pub use self::password::PasswordConnector;

/// The port used when none is given.
pub const DEFAULT_PORT: u16 = 22;

/// Runs commands on one remote host.
///
/// An implementation owns exactly one session. It runs one command at a time; concurrent callers
/// wait their turn. Once [Connect::close] has been called, every subsequent command fails fast with
/// [Error::Connection].
#[async_trait]
pub trait Connect: Send + Sync {
    /// A label identifying the host, e.g. its address. Used to key fleet results and tag log
    /// messages.
    fn host(&self) -> &str;

    /// Runs `command` as the login user and returns its output.
    ///
    /// A non-zero exit status is not an error at this level; callers decide what it means.
    async fn run(&self, command: &str) -> Result<Output>;

    /// Runs `command` as the login user, writes `input` to its standard input, and then closes
    /// standard input.
    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<Output>;

    /// Runs `command` as root through `sudo`, authenticating with `password`, or with the login
    /// password if `password` is `None`.
    async fn sudo_run(&self, command: &str, password: Option<&str>) -> Result<Output>;

    /// Closes the session. Safe to call more than once.
    async fn close(&self) -> Result<()>;
}

/// What it takes to reach and authenticate to a host.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Host name or IP address.
    pub address: String,

    pub port: u16,

    pub username: String,

    /// The account password. Used to authenticate `sudo`, and to log in when key-based login
    /// isn't possible.
    pub password: String,

    /// An SSH private key to offer during login, if the SSH agent and default keys aren't enough.
    pub identity_file: Option<PathBuf>,
}

impl ConnectionInfo {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        ConnectionInfo {
            address: address.into(),
            port,
            username: username.into(),
            password: password.into(),
            identity_file: None,
        }
    }

    /// The label used for this host in logs and results: the address, plus the port if it isn't
    /// [DEFAULT_PORT].
    pub fn label(&self) -> String {
        match self.port {
            DEFAULT_PORT => self.address.clone(),
            port => format!("{}:{port}", self.address),
        }
    }
}

// Keep the password out of logs and panic messages.
impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInfo")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("identity_file", &self.identity_file)
            .finish()
    }
}

/// Connects and authenticates to the host described by `info`.
///
/// Key-based login through [SshConnector] comes first. If that is refused and `info` has a
/// password, this logs in with the password through a [PasswordConnector] instead.
///
/// # Errors
///
/// Returns the [PasswordConnector]'s error if both attempts fail, and [Error::Timeout] without a
/// second attempt if key-based login timed out.
#[cfg(all(feature = "openssh", feature = "password-login"))]
pub async fn connect(
    info: ConnectionInfo,
    settings: &Settings,
    log: &Log,
) -> Result<Arc<dyn Connect>> {
    match SshConnector::connect(info.clone(), settings, log).await {
        Ok(connector) => return Ok(Arc::new(connector)),
        Err(Error::Connection { reason, .. }) if !info.password.is_empty() => {
            log.scoped(info.label())
                .notice(format!("key-based login failed ({reason}); trying the password"));
        }
        Err(error) => return Err(error),
    }
    let connector = PasswordConnector::connect(info, settings, log).await?;
    Ok(Arc::new(connector))
}

/// Runs [connect] for every host in `infos` concurrently.
///
/// Returns one `(label, result)` pair per host, in the order given. A failure to reach one host
/// has no effect on the others.
#[cfg(all(feature = "openssh", feature = "password-login"))]
pub async fn connect_all(
    infos: Vec<ConnectionInfo>,
    settings: &Settings,
    log: &Log,
) -> Vec<(String, Result<Arc<dyn Connect>>)> {
    let handles: Vec<_> = infos
        .into_iter()
        .map(|info| {
            let label = info.label();
            let settings = settings.clone();
            let log = log.clone();
            let handle = tokio::spawn(async move { connect(info, &settings, &log).await });
            (label, handle)
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for (label, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(Error::Task {
                member: label.clone(),
                reason: join_error.to_string(),
            }),
        };
        results.push((label, result));
    }
    results
}

/// Wraps `command` for execution as root with the password supplied on standard input.
///
/// `command` is shell-quoted as a single argument to `su -c`, so it may itself contain quotes,
/// pipes, and redirections.
pub fn sudo_command(command: &str) -> Result<String> {
    Ok(format!("sudo -S -p '' su -c {}", sanitize::quote(command)?))
}

/// Decodes a command's standard output, replacing invalid UTF-8.
///
/// Fine for command output that is only parsed. Never use it for data that may be written back.
pub fn stdout_text(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Returns `output` if the command succeeded, or an [Error::Command] describing the failure.
pub fn ensure_success(host: &str, command: &str, output: Output) -> Result<Output> {
    if output.status.success() {
        return Ok(output);
    }

    let status = match output.status.code() {
        Some(i) => format!("exit code {i}"),
        None => "error".to_string(),
    };
    Err(Error::Command {
        host: host.to_string(),
        command: command.to_string(),
        status,
        stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
    })
}

/// Runs `command` and returns its standard output as text.
pub(crate) async fn run_text(connector: &dyn Connect, command: &str) -> Result<String> {
    let output = connector.run(command).await?;
    Ok(stdout_text(&output))
}

/// Runs `command` with `input` and fails with [Error::Command] on a non-zero exit status.
pub(crate) async fn run_checked_with_input(
    connector: &dyn Connect,
    command: &str,
    input: &[u8],
) -> Result<Output> {
    let output = connector.run_with_input(command, input).await?;
    ensure_success(connector.host(), command, output)
}

/// Runs `command` elevated and fails with [Error::Command] on a non-zero exit status.
pub(crate) async fn sudo_checked(
    connector: &dyn Connect,
    command: &str,
    password: Option<&str>,
) -> Result<Output> {
    let output = connector.sudo_run(command, password).await?;
    ensure_success(connector.host(), command, output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;

    fn output(code: i32, stderr: &str) -> Output {
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[test]
    fn sudo_command_quotes_the_inner_command() {
        let wrapped = sudo_command("apt install nginx -y").unwrap();
        assert!(wrapped.starts_with("sudo -S -p '' su -c "));
        assert_eq!(
            Some("apt install nginx -y".to_string()),
            shlex::split(&wrapped).and_then(|mut words| words.pop()),
        );

        let wrapped = sudo_command("printf %s 'a b' > /etc/x").unwrap();
        let words = shlex::split(&wrapped).unwrap();
        assert_eq!(
            vec!["sudo", "-S", "-p", "", "su", "-c", "printf %s 'a b' > /etc/x"],
            words,
        );
    }

    #[test]
    fn ensure_success_reports_exit_code_and_stderr() {
        assert!(ensure_success("h", "true", output(0, "")).is_ok());

        match ensure_success("h", "apt purge x -y", output(100, "E: nope\n")) {
            Err(Error::Command {
                host,
                status,
                stderr,
                ..
            }) => {
                assert_eq!("h", host);
                assert_eq!("exit code 100", status);
                assert_eq!("E: nope", stderr);
            }
            other => panic!("expected Error::Command, got {other:?}"),
        }
    }

    #[test]
    fn debug_redacts_password() {
        let info = ConnectionInfo::new("10.0.0.5", 2222, "admin", "hunter2");
        let debug = format!("{info:?}");
        assert!(!debug.contains("hunter2"));
        assert_eq!("10.0.0.5:2222", info.label());
        assert_eq!("10.0.0.5", ConnectionInfo::new("10.0.0.5", 22, "a", "b").label());
    }
}
