//! Thin async wrapper over the `git` binary.
//!
//! Every call passes an explicit argument vector and runs under a timeout.
//! The child is killed if the timeout fires.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Error)]
pub enum GitInvokeError {
    #[error("failed to run git: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("git {command} timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stderr if present, otherwise stdout, trimmed.
    pub fn message(&self) -> String {
        let err = self.stderr.trim();
        if err.is_empty() {
            self.stdout.trim().to_string()
        } else {
            err.to_string()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitCli {
    workdir: PathBuf,
    program: PathBuf,
}

impl GitCli {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            program: PathBuf::from("git"),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub async fn run(&self, args: &[&str], limit: Duration) -> Result<GitOutput, GitInvokeError> {
        self.run_with_stdin(args, None, limit).await
    }

    pub async fn run_with_stdin(
        &self,
        args: &[&str],
        stdin: Option<&[u8]>,
        limit: Duration,
    ) -> Result<GitOutput, GitInvokeError> {
        let command = args.first().copied().unwrap_or_default().to_string();
        debug!(args = ?args, cwd = %self.workdir.display(), "running git");

        let mut child = Command::new(&self.program)
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(GitInvokeError::Spawn)?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).await.map_err(GitInvokeError::Spawn)?;
            // dropping the pipe closes stdin
        }

        let output = match timeout(limit, child.wait_with_output()).await {
            Ok(result) => result.map_err(GitInvokeError::Spawn)?,
            Err(_) => {
                return Err(GitInvokeError::Timeout {
                    command,
                    timeout: limit,
                });
            }
        };

        Ok(GitOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
