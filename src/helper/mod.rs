//! Helper process abstraction
//!
//! The oscilloscope is reached through `hpctrl`, an opaque helper that speaks a line
//! protocol on its standard streams. This module hides how the helper is obtained:
//!
//! - [`ExecutableLauncher`] spawns the real (or fake) binary with `-i`.
//! - [`MockHelper`] runs an in-memory stub for tests.
//!
//! Both hand back a [`HelperProcess`]: a writable input stream, a readable output stream
//! and a [`HelperChild`] handle used to wait for or kill the process.

pub mod mock;
pub mod reader;

pub use mock::MockHelper;
pub use reader::{OutputBuffer, OutputReader};

use crate::config::HelperConfig;
use crate::error::{AdapterError, AdapterResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Input stream of the helper.
pub type HelperInput = Box<dyn AsyncWrite + Send + Unpin>;

/// Output stream of the helper.
pub type HelperOutput = Box<dyn AsyncRead + Send + Unpin>;

/// Spawns helper processes.
///
/// Implementations must not retry: a failed launch is reported once as
/// [`AdapterError::Launch`].
pub trait HelperLauncher: Send + Sync {
    /// Start a new helper instance with its streams wired up.
    fn launch(&self) -> AdapterResult<HelperProcess>;

    /// Human-readable description for logs.
    fn describe(&self) -> String;
}

/// OS-level control over a launched helper.
#[async_trait]
pub trait HelperChild: Send {
    /// Process id, if the helper is an OS process.
    fn id(&self) -> Option<u32>;

    /// Wait up to `grace` for the helper to exit on its own. Returns `true` if it did.
    async fn wait_for_exit(&mut self, grace: Duration) -> bool;

    /// Forcefully terminate the helper and reap it.
    async fn kill(&mut self) -> std::io::Result<()>;
}

/// A freshly launched helper: its streams and its process handle.
pub struct HelperProcess {
    /// Standard input of the helper
    pub stdin: HelperInput,
    /// Standard output of the helper
    pub stdout: HelperOutput,
    /// Process handle
    pub child: Box<dyn HelperChild>,
}

/// Launches the helper executable from disk.
#[derive(Debug, Clone)]
pub struct ExecutableLauncher {
    path: PathBuf,
}

impl ExecutableLauncher {
    /// Launcher for an explicit executable path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Launcher for the executable selected by the helper settings.
    pub fn from_config(config: &HelperConfig) -> Self {
        Self::new(config.executable_path())
    }

    /// Executable that will be spawned.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HelperLauncher for ExecutableLauncher {
    fn launch(&self) -> AdapterResult<HelperProcess> {
        let launch_error = |source: std::io::Error| AdapterError::Launch {
            path: self.path.display().to_string(),
            source,
        };

        let mut child = Command::new(&self.path)
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(std::io::Error::other("helper stdin unavailable")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(std::io::Error::other("helper stdout unavailable")))?;

        // Stderr is only logged. Nobody reads responses from it.
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr));
        }

        info!(path = %self.path.display(), pid = ?child.id(), "Launched helper");

        Ok(HelperProcess {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            child: Box::new(child),
        })
    }

    fn describe(&self) -> String {
        format!("{} -i", self.path.display())
    }
}

async fn log_stderr(stderr: tokio::process::ChildStderr) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if !line.trim().is_empty() => warn!(line = %line, "Helper stderr"),
            Ok(Some(_)) => {}
            Ok(None) | Err(_) => break,
        }
    }
}

#[async_trait]
impl HelperChild for Child {
    fn id(&self) -> Option<u32> {
        Child::id(self)
    }

    async fn wait_for_exit(&mut self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.wait()).await {
            Ok(Ok(status)) => {
                debug!(%status, "Helper exited");
                true
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Failed to wait for helper");
                false
            }
            Err(_) => false,
        }
    }

    async fn kill(&mut self) -> std::io::Result<()> {
        Child::kill(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launcher_from_config() {
        let config = HelperConfig {
            testing: true,
            ..Default::default()
        };
        let launcher = ExecutableLauncher::from_config(&config);
        assert_eq!(launcher.path(), config.executable_path());
        assert!(launcher.describe().ends_with(" -i"));
    }

    #[tokio::test]
    async fn test_missing_executable_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ExecutableLauncher::new(dir.path().join("no_such_helper"));

        match launcher.launch() {
            Err(AdapterError::Launch { path, source }) => {
                assert!(path.contains("no_such_helper"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("launch of a missing executable succeeded"),
        }
    }
}
