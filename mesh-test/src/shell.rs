//! The single chokepoint through which the harness runs external processes.
//!
//! A [`Shell`] is one `sh -c` command line. Running it captures stdout and
//! stderr and normalizes the result: `Ok(stdout)` when the process exits 0,
//! [`Error::CommandFailed`] otherwise. How much of the invocation ends up in
//! the test log is a [`Verbosity`] policy of the same primitive.

use crate::{Error, Result};
use std::{collections::BTreeMap, fmt, process::Stdio, time::Duration};
use tokio::io::AsyncWriteExt;

/// How much of an invocation is written to the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Verbosity {
    /// Logs the command, its output and its error.
    #[default]
    Loud,

    /// Logs the command and its error, never its output. Used for commands
    /// that print secrets or large documents.
    MuteOutput,

    /// Logs the command only. Output and error are only surfaced through the
    /// returned error.
    MuteOutputError,

    /// Logs nothing.
    Silent,
}

#[derive(Clone, Debug)]
#[must_use]
pub struct Shell {
    command: String,
    input: Option<String>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
    verbosity: Verbosity,
}

/// A long-running process started with [`Shell::spawn`]. The process is
/// killed when the handle is dropped.
#[derive(Debug)]
pub struct Background {
    command: String,
    child: tokio::process::Child,
}

/// Renders a command line with `format!` syntax.
///
/// ```
/// let ns = "foo";
/// let cmd = mesh_test::shell!("kubectl get pods -n {ns}");
/// assert_eq!(cmd.command(), "kubectl get pods -n foo");
/// ```
#[macro_export]
macro_rules! shell {
    ($($arg:tt)*) => {
        $crate::shell::Shell::new(::std::format!($($arg)*))
    };
}

// === impl Shell ===

impl Shell {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            input: None,
            env: BTreeMap::new(),
            timeout: None,
            verbosity: Verbosity::default(),
        }
    }

    /// Text written to the process's stdin.
    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Kills the process if it has not exited within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn mute_output(self) -> Self {
        self.verbosity(Verbosity::MuteOutput)
    }

    pub fn mute_output_error(self) -> Self {
        self.verbosity(Verbosity::MuteOutputError)
    }

    pub fn silent(self) -> Self {
        self.verbosity(Verbosity::Silent)
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Runs the command to completion and returns its stdout with trailing
    /// whitespace trimmed.
    pub async fn run(&self) -> Result<String> {
        if self.verbosity != Verbosity::Silent {
            tracing::info!(command = %self.command, "running");
        }

        let mut child = self
            .build()
            .stdin(if self.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.spawn_error(source))?;

        if let (Some(input), Some(mut stdin)) = (self.input.clone(), child.stdin.take()) {
            // Written concurrently so a child that fills its stdout pipe before
            // draining stdin cannot deadlock. The child may exit without
            // reading its input at all.
            tokio::spawn(async move {
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        let output = match self.timeout {
            None => child.wait_with_output().await,
            Some(timeout) => match tokio::time::timeout(timeout, child.wait_with_output()).await {
                Ok(res) => res,
                Err(_) => {
                    if self.verbosity != Verbosity::Silent {
                        tracing::warn!(command = %self.command, ?timeout, "timed out");
                    }
                    return Err(Error::CommandTimeout {
                        command: self.command.clone(),
                        timeout,
                    });
                }
            },
        }
        .map_err(|source| self.spawn_error(source))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            if self.verbosity == Verbosity::Loud && !stdout.trim().is_empty() {
                tracing::info!("output:\n{}", stdout.trim_end());
            }
            return Ok(stdout.trim_end().to_string());
        }

        let code = output.status.code();
        match self.verbosity {
            Verbosity::Loud => {
                tracing::warn!(command = %self.command, ?code, "failed");
                if !stdout.trim().is_empty() {
                    tracing::warn!("output:\n{}", stdout.trim_end());
                }
                if !stderr.trim().is_empty() {
                    tracing::warn!("error:\n{}", stderr.trim_end());
                }
            }
            Verbosity::MuteOutput => {
                tracing::warn!(command = %self.command, ?code, "failed");
                if !stderr.trim().is_empty() {
                    tracing::warn!("error:\n{}", stderr.trim_end());
                }
            }
            Verbosity::MuteOutputError | Verbosity::Silent => {}
        }

        Err(Error::CommandFailed {
            command: self.command.clone(),
            code,
            stdout,
            stderr,
        })
    }

    /// Starts the command in the background (port-forwards, load
    /// generators). Its output is discarded.
    pub fn spawn(&self) -> Result<Background> {
        if self.verbosity != Verbosity::Silent {
            tracing::info!(command = %self.command, "starting in background");
        }
        let child = self
            .build()
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| self.spawn_error(source))?;
        Ok(Background {
            command: self.command.clone(),
            child,
        })
    }

    fn build(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&self.command).envs(&self.env);
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> Error {
        Error::Spawn {
            command: self.command.clone(),
            source,
        }
    }
}

impl fmt::Display for Shell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)
    }
}

// === impl Background ===

impl Background {
    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Returns true while the process has not exited.
    pub fn is_running(&mut self) -> Result<bool> {
        match self.child.try_wait() {
            Ok(status) => Ok(status.is_none()),
            Err(source) => Err(Error::Spawn {
                command: self.command.clone(),
                source,
            }),
        }
    }

    /// Kills the process and waits for it to exit.
    pub async fn stop(mut self) -> Result<()> {
        tracing::debug!(command = %self.command, "stopping");
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited.
            Err(error) if error.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(source) => Err(Error::Spawn {
                command: self.command,
                source,
            }),
        }
    }
}
