//! A fake [Connect] implementation for tests.
//!
//! [FakeConnector] never touches the network. It records every command it receives, answers
//! commands from a script of canned responses, and emulates just enough of a remote file system
//! (`test -e`, `mkdir -p`, `touch`, `cp`, `cat`, `mktemp`, `rm -f`, and the redirections that
//! documents and repositories use to write) to exercise the config-file protocol end to end.
//!
//! Elevated commands are recorded unwrapped, i.e. as the command that would run under `sudo`,
//! together with the password that would have been piped in.
//!
//! To enable better integration testing, this module is public but stripped from documentation.

use crate::connector::Connect;
use crate::error::{Error, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::collections::BTreeMap;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Output};
use std::sync::{Arc, Mutex, MutexGuard};

/// One command as received by a [FakeConnector].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandRecord {
    pub command: String,

    /// Whether the command came through [Connect::sudo_run].
    pub elevated: bool,

    /// The password passed to [Connect::sudo_run], if any.
    pub password: Option<String>,

    /// What [Connect::run_with_input] sent to standard input, if anything.
    pub input: Option<Vec<u8>>,
}

/// A canned reply to a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl Response {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self::ok_bytes(stdout.into().into_bytes())
    }

    /// Like [Response::ok], for output that isn't necessarily UTF-8.
    pub fn ok_bytes(stdout: impl Into<Vec<u8>>) -> Self {
        Response {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Response {
            stdout: Vec::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    fn into_output(self) -> Output {
        Output {
            // from_raw takes a wait status, which stores the exit code in the second byte.
            status: ExitStatus::from_raw(self.exit_code << 8),
            stdout: self.stdout,
            stderr: self.stderr.into_bytes(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    /// Maps a command prefix to its response. The longest matching prefix wins, and a match takes
    /// precedence over the emulated file system.
    responses: IndexMap<String, Response>,

    /// Every command received, in order.
    records: Vec<CommandRecord>,

    /// The emulated remote file system: path -> contents.
    files: BTreeMap<String, String>,

    /// If set, every command fails with this connection error.
    unreachable: Option<String>,

    /// How many files `mktemp` has created.
    temporary_files: usize,

    closed: bool,
}

/// A scriptable, recording stand-in for an SSH connection.
///
/// Clones share state, so a test can keep one clone for inspection and hand another to the code
/// under test.
#[derive(Clone, Debug)]
pub struct FakeConnector {
    host: String,
    state: Arc<Mutex<State>>,
}

impl FakeConnector {
    pub fn new(host: impl Into<String>) -> Self {
        FakeConnector {
            host: host.into(),
            state: Arc::default(),
        }
    }

    /// Returns a shareable trait object backed by a clone of this connector.
    pub fn shared(&self) -> Arc<dyn Connect> {
        Arc::new(self.clone())
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replies to any command starting with `prefix` with `stdout` and exit code 0.
    pub fn respond(&self, prefix: impl Into<String>, stdout: impl Into<String>) -> &Self {
        self.respond_with(prefix, Response::ok(stdout))
    }

    /// Replies to any command starting with `prefix` with `response`.
    pub fn respond_with(&self, prefix: impl Into<String>, response: Response) -> &Self {
        self.state().responses.insert(prefix.into(), response);
        self
    }

    /// Makes every subsequent command fail with [Error::Connection].
    pub fn set_unreachable(&self, reason: impl Into<String>) {
        self.state().unreachable = Some(reason.into());
    }

    /// Places a file in the emulated remote file system.
    pub fn put_file(&self, path: impl Into<String>, contents: impl Into<String>) -> &Self {
        self.state().files.insert(path.into(), contents.into());
        self
    }

    /// Returns the contents of a file in the emulated remote file system.
    pub fn file(&self, path: &str) -> Option<String> {
        self.state().files.get(path).cloned()
    }

    /// Returns every path in the emulated remote file system.
    pub fn paths(&self) -> Vec<String> {
        self.state().files.keys().cloned().collect()
    }

    /// Returns every command received so far.
    pub fn records(&self) -> Vec<CommandRecord> {
        self.state().records.clone()
    }

    /// Returns the text of every command received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state()
            .records
            .iter()
            .map(|r| r.command.clone())
            .collect()
    }

    /// Returns the text of every elevated command received so far.
    pub fn elevated_commands(&self) -> Vec<String> {
        self.state()
            .records
            .iter()
            .filter(|r| r.elevated)
            .map(|r| r.command.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    fn execute(
        &self,
        command: &str,
        elevated: bool,
        password: Option<&str>,
        input: Option<&[u8]>,
    ) -> Result<Output> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::connection(&self.host, "session is closed"));
        }
        if let Some(ref reason) = state.unreachable {
            return Err(Error::connection(&self.host, reason));
        }

        state.records.push(CommandRecord {
            command: command.to_string(),
            elevated,
            password: password.map(str::to_string),
            input: input.map(<[u8]>::to_vec),
        });

        let scripted = state
            .responses
            .iter()
            .filter(|(prefix, _)| command.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, response)| response.clone());

        let response = match scripted {
            Some(response) => response,
            None => file_system(&mut state, command, input).unwrap_or_else(|| Response::ok("")),
        };
        Ok(response.into_output())
    }
}

/// Emulates the file commands used by documents and repositories. Returns `None` for anything
/// else.
fn file_system(state: &mut State, command: &str, input: Option<&[u8]>) -> Option<Response> {
    let words = shlex::split(command)?;
    let words: Vec<&str> = words.iter().map(String::as_str).collect();
    let files = &mut state.files;

    let response = match words.as_slice() {
        ["test", "-e", path, "&&", "echo", "exist"] => match files.contains_key(*path) {
            true => Response::ok("exist\n"),
            false => Response::failed(1, ""),
        },
        ["mkdir", "-p", _] => Response::ok(""),
        ["touch", path] => {
            files.entry(path.to_string()).or_default();
            Response::ok("")
        }
        ["cp", from, to] => match files.get(*from).cloned() {
            Some(contents) => {
                files.insert(to.to_string(), contents);
                Response::ok("")
            }
            None => Response::failed(1, format!("cp: cannot stat '{from}'")),
        },
        ["cat", path] => match files.get(*path) {
            Some(contents) => Response::ok(contents.clone()),
            None => Response::failed(1, format!("cat: {path}: No such file or directory")),
        },
        ["cat", ">", path] => {
            let contents = String::from_utf8_lossy(input.unwrap_or_default()).into_owned();
            files.insert(path.to_string(), contents);
            Response::ok("")
        }
        ["cat", from, ">", to] => match files.get(*from).cloned() {
            Some(contents) => {
                files.insert(to.to_string(), contents);
                Response::ok("")
            }
            None => Response::failed(1, format!("cat: {from}: No such file or directory")),
        },
        ["mktemp"] => {
            let path = format!("/tmp/tmp.{}", state.temporary_files);
            state.temporary_files += 1;
            files.insert(path.clone(), String::new());
            Response::ok(format!("{path}\n"))
        }
        ["rm", "-f", path] => {
            files.remove(*path);
            Response::ok("")
        }
        ["printf", "%s\\n", rest @ .., ">>", path] => {
            let file = files.entry(path.to_string()).or_default();
            for line in rest {
                file.push_str(line);
                file.push('\n');
            }
            Response::ok("")
        }
        _ => return None,
    };
    Some(response)
}

#[async_trait]
impl Connect for FakeConnector {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<Output> {
        self.execute(command, false, None, None)
    }

    async fn run_with_input(&self, command: &str, input: &[u8]) -> Result<Output> {
        self.execute(command, false, None, Some(input))
    }

    async fn sudo_run(&self, command: &str, password: Option<&str>) -> Result<Output> {
        self.execute(command, true, password, None)
    }

    async fn close(&self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::stdout_text;

    #[tokio::test]
    async fn longest_prefix_wins() {
        let fake = FakeConnector::new("h");
        fake.respond("apt list", "all\n")
            .respond("apt list --installed", "installed\n");

        let all = fake.run("apt list").await.unwrap();
        let installed = fake.run("apt list --installed").await.unwrap();
        assert_eq!("all\n", stdout_text(&all));
        assert_eq!("installed\n", stdout_text(&installed));
        assert_eq!(vec!["apt list", "apt list --installed"], fake.commands());
    }

    #[tokio::test]
    async fn emulates_files() {
        let fake = FakeConnector::new("h");
        fake.put_file("/etc/a", "x");

        let exists = fake.run("test -e /etc/a && echo exist").await.unwrap();
        assert_eq!("exist\n", stdout_text(&exists));
        let missing = fake.run("test -e /etc/b && echo exist").await.unwrap();
        assert!(!missing.status.success());

        fake.sudo_run("cp /etc/a /etc/a.0", None).await.unwrap();
        let temporary = stdout_text(&fake.run("mktemp").await.unwrap());
        assert_eq!("/tmp/tmp.0\n", temporary);
        fake.run_with_input("cat > /tmp/tmp.0", b"new text")
            .await
            .unwrap();
        fake.sudo_run("cat /tmp/tmp.0 > /etc/a", None).await.unwrap();
        fake.run("rm -f /tmp/tmp.0").await.unwrap();
        assert_eq!(Some("x".to_string()), fake.file("/etc/a.0"));
        assert_eq!(Some("new text".to_string()), fake.file("/etc/a"));
        assert_eq!(None, fake.file("/tmp/tmp.0"));
        assert_eq!(
            Some(b"new text".to_vec()),
            fake.records()[4].input,
        );
    }

    #[tokio::test]
    async fn closed_connector_fails_fast() {
        let fake = FakeConnector::new("h");
        fake.close().await.unwrap();
        fake.close().await.unwrap();
        assert!(matches!(
            fake.run("true").await,
            Err(Error::Connection { .. })
        ));
        assert!(fake.commands().is_empty());
    }
}
