//! Bounded execution of external programs.
//!
//! Every interaction with the operating system goes through a
//! [`CommandRunner`]. The production implementation spawns the program with
//! `tokio::process` and kills it when the timeout elapses; tests substitute a
//! simulated NetworkManager.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::{Result, WifiError};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        CommandOutput {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        CommandOutput {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Diagnostic text for logs and error messages: stderr when present,
    /// stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with `args`, waiting at most `timeout`.
    ///
    /// A non-zero exit status is not an error at this level; it is returned
    /// in [`CommandOutput::status`]. Errors are reserved for programs that
    /// could not be started or did not finish in time.
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput>;
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let command_line = render(program, args);
        debug!("exec: {}", command_line);

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WifiError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|source| WifiError::Spawn {
                program: program.to_string(),
                source,
            })?,
            Err(_) => {
                return Err(WifiError::Timeout {
                    command: command_line,
                    after: timeout,
                });
            }
        };

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Human-readable command line, with passwords masked.
pub fn render(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    let mut mask_next = false;
    for arg in args {
        line.push(' ');
        if mask_next {
            line.push_str("********");
        } else {
            line.push_str(arg);
        }
        mask_next = matches!(*arg, "password" | "wifi-sec.psk");
    }
    line
}
