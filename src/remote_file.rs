//! File operations on a managed host, built from plain POSIX commands.
//!
//! Everything except the existence check and the staging of new contents runs as root, since
//! configuration files usually belong to root. Paths are shell-quoted, never checked against the
//! sanitizer's character set: `/` is the one character every path needs.
//!
//! File contents never appear on a command line. A write streams them into a private temporary
//! file first, and root copies that over the target.

use crate::connector::{
    ensure_success, run_checked_with_input, run_text, stdout_text, sudo_checked, Connect,
};
use crate::error::{Error, Result};
use crate::sanitize::quote;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// One file on one host.
#[derive(Clone)]
pub struct RemoteFile {
    connector: Arc<dyn Connect>,
    path: String,
    sudo_password: Option<String>,
}

impl RemoteFile {
    /// # Errors
    ///
    /// Returns [Error::InvalidInput] unless `path` is absolute.
    pub fn new(
        connector: Arc<dyn Connect>,
        path: impl Into<String>,
        sudo_password: Option<String>,
    ) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') {
            return Err(Error::InvalidInput(format!(
                "remote paths must be absolute: {path:?}"
            )));
        }
        Ok(RemoteFile {
            connector,
            path,
            sudo_password,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> &str {
        self.connector.host()
    }

    async fn sudo(&self, command: &str) -> Result<String> {
        let output =
            sudo_checked(&*self.connector, command, self.sudo_password.as_deref()).await?;
        Ok(stdout_text(&output))
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        let command = format!("test -e {} && echo exist", quote(path)?);
        Ok(run_text(&*self.connector, &command).await?.contains("exist"))
    }

    pub async fn exists(&self) -> Result<bool> {
        self.path_exists(&self.path).await
    }

    /// Creates the file, and any missing parent directories, if it doesn't exist.
    pub async fn touch(&self) -> Result<()> {
        if let Some(parent) = Path::new(&self.path).parent() {
            let parent = parent.to_string_lossy();
            if parent != "/" && !parent.is_empty() {
                self.sudo(&format!("mkdir -p {}", quote(&parent)?)).await?;
            }
        }
        self.sudo(&format!("touch {}", quote(&self.path)?)).await?;
        Ok(())
    }

    /// Returns the first of `<path>.0`, `<path>.1`, ... that doesn't exist yet.
    pub async fn free_backup_path(&self) -> Result<String> {
        let mut suffix: u32 = 0;
        loop {
            let candidate = format!("{}.{suffix}", self.path);
            if !self.path_exists(&candidate).await? {
                return Ok(candidate);
            }
            suffix += 1;
        }
    }

    /// Copies the file to [Self::free_backup_path] and returns the backup's path. Existing backups
    /// are never overwritten.
    pub async fn create_backup(&self) -> Result<String> {
        let backup = self.free_backup_path().await?;
        self.sudo(&format!("cp {} {}", quote(&self.path)?, quote(&backup)?))
            .await?;
        Ok(backup)
    }

    /// Returns the file's contents.
    ///
    /// # Errors
    ///
    /// Returns [Error::Parse] if the contents aren't valid UTF-8. Such a file can't be edited
    /// without damaging it.
    pub async fn read(&self) -> Result<String> {
        let command = format!("cat {}", quote(&self.path)?);
        let output =
            sudo_checked(&*self.connector, &command, self.sudo_password.as_deref()).await?;
        String::from_utf8(output.stdout).map_err(|error| {
            let valid = &error.as_bytes()[..error.utf8_error().valid_up_to()];
            Error::Parse {
                source_name: format!("{}:{}", self.host(), self.path),
                line: valid.iter().filter(|&&b| b == b'\n').count() + 1,
                message: "not valid UTF-8".to_string(),
            }
        })
    }

    /// Replaces the file's contents with `contents`, byte for byte. The file keeps its owner and
    /// mode.
    pub async fn write(&self, contents: &str) -> Result<()> {
        let staged = self.temporary_file().await?;
        let staged = quote(&staged)?;

        let copied = self.copy_in(&staged, contents.as_bytes()).await;
        let removed = self.connector.run(&format!("rm -f {staged}")).await;
        copied?;
        removed?;
        Ok(())
    }

    /// Creates an empty file only the login user can read, and returns its path.
    async fn temporary_file(&self) -> Result<String> {
        let output = self.connector.run("mktemp").await?;
        let output = ensure_success(self.host(), "mktemp", output)?;
        let path = stdout_text(&output).trim().to_string();
        if !path.starts_with('/') {
            return Err(Error::InvalidInput(format!(
                "mktemp on {} returned {path:?}",
                self.host()
            )));
        }
        Ok(path)
    }

    /// Streams `contents` into the already quoted `staged` file, then copies it over this file.
    async fn copy_in(&self, staged: &str, contents: &[u8]) -> Result<()> {
        run_checked_with_input(&*self.connector, &format!("cat > {staged}"), contents).await?;
        self.sudo(&format!("cat {staged} > {}", quote(&self.path)?))
            .await?;
        Ok(())
    }
}

impl fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteFile")
            .field("host", &self.host())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeConnector, Response};

    fn file(fake: &FakeConnector, path: &str) -> RemoteFile {
        RemoteFile::new(fake.shared(), path, Some("pw".to_string())).unwrap()
    }

    #[test]
    fn relative_paths_are_rejected() {
        let fake = FakeConnector::new("h");
        assert!(matches!(
            RemoteFile::new(fake.shared(), "etc/app.ini", None),
            Err(Error::InvalidInput(_)),
        ));
    }

    #[tokio::test]
    async fn backup_never_overwrites() {
        let fake = FakeConnector::new("h");
        fake.put_file("/etc/app.ini", "current")
            .put_file("/etc/app.ini.0", "oldest")
            .put_file("/etc/app.ini.1", "older");
        let file = file(&fake, "/etc/app.ini");

        assert_eq!("/etc/app.ini.2", file.create_backup().await.unwrap());
        assert_eq!("/etc/app.ini.3", file.create_backup().await.unwrap());
        assert_eq!(Some("oldest".to_string()), fake.file("/etc/app.ini.0"));
        assert_eq!(Some("current".to_string()), fake.file("/etc/app.ini.3"));
    }

    #[tokio::test]
    async fn touch_creates_parents_elevated() {
        let fake = FakeConnector::new("h");
        let file = file(&fake, "/opt/my app/conf.ini");

        assert!(!file.exists().await.unwrap());
        file.touch().await.unwrap();
        assert!(file.exists().await.unwrap());
        assert_eq!(Some(String::new()), fake.file("/opt/my app/conf.ini"));

        let elevated: Vec<_> = fake.records().into_iter().filter(|r| r.elevated).collect();
        assert_eq!(2, elevated.len());
        assert!(elevated[0].command.starts_with("mkdir -p "));
        assert!(elevated
            .iter()
            .all(|r| r.password.as_deref() == Some("pw")));
    }

    #[tokio::test]
    async fn write_then_read_is_exact() {
        let fake = FakeConnector::new("h");
        let file = file(&fake, "/etc/motd");
        let text = "it's a \"quoted\" $HOME; `rm -rf /`\n\n  indented\n";

        file.write(text).await.unwrap();
        assert_eq!(text, file.read().await.unwrap());
        assert_eq!(vec!["/etc/motd"], fake.paths());
    }

    #[tokio::test]
    async fn large_contents_stay_off_the_command_line() {
        let fake = FakeConnector::new("h");
        let file = file(&fake, "/etc/hosts.big");
        // Well past the kernel's 128 KiB limit on a single argument.
        let text = "10.0.0.1 host.example.com\n".repeat(8_000);
        assert!(text.len() > 200 * 1024);

        file.write(&text).await.unwrap();
        assert_eq!(Some(text.clone()), fake.file("/etc/hosts.big"));
        assert!(fake.commands().iter().all(|command| command.len() < 256));

        let staged: Vec<_> = fake
            .records()
            .into_iter()
            .filter_map(|record| record.input)
            .collect();
        assert_eq!(vec![text.into_bytes()], staged);
        assert_eq!(
            vec!["cat /tmp/tmp.0 > /etc/hosts.big"],
            fake.elevated_commands()
        );
    }

    #[tokio::test]
    async fn failed_staging_leaves_the_file_alone() {
        let fake = FakeConnector::new("h");
        fake.put_file("/etc/motd", "old");
        fake.respond_with("cat > ", Response::failed(1, "No space left on device"));
        let file = file(&fake, "/etc/motd");

        assert!(matches!(
            file.write("new").await,
            Err(Error::Command { .. })
        ));
        assert_eq!(Some("old".to_string()), fake.file("/etc/motd"));
        assert!(fake.elevated_commands().is_empty());
        assert_eq!(Some("rm -f /tmp/tmp.0"), fake.commands().last().map(String::as_str));
    }

    #[tokio::test]
    async fn invalid_utf8_is_not_read() {
        let fake = FakeConnector::new("h");
        fake.respond_with(
            "cat /etc/latin1.conf",
            Response::ok_bytes(b"name = ok\nmotto = caf\xe9\n".to_vec()),
        );
        let file = file(&fake, "/etc/latin1.conf");

        match file.read().await {
            Err(Error::Parse { line, message, .. }) => {
                assert_eq!(2, line);
                assert!(message.contains("UTF-8"));
            }
            other => panic!("expected Error::Parse, got {other:?}"),
        }
    }
}
