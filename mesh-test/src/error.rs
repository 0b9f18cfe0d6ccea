use crate::check::Failure;
use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the harness.
///
/// Every variant maps onto one way a test step can go wrong: an external
/// command failed, an assertion did not hold, a polled condition never became
/// true, or the network refused to carry a probe.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A shell command exited unsuccessfully.
    #[error("command failed (exit code {}): {command}{}", display_code(.code), display_output(.stdout, .stderr))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// A shell command could not be started or waited on.
    #[error("failed to run command: {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out after {timeout:?}: {command}")]
    CommandTimeout { command: String, timeout: Duration },

    #[error(transparent)]
    Assertion(#[from] Failure),

    /// A retried action never succeeded; `last` is the failure of the final
    /// attempt.
    #[error("{operation} did not succeed after {attempts} attempt(s) ({elapsed:.2?}): {last}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        elapsed: Duration,
        last: Box<Error>,
    },

    #[error("condition was not met after {trials} trial(s)")]
    PollExhausted { trials: u32 },

    #[error("error during trial {trial}")]
    PollAborted {
        trial: u32,
        #[source]
        source: Box<Error>,
    },

    /// The HTTP request could not complete (DNS, TCP, TLS, timeout).
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    #[error("failed to access {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no manifest named {0:?}")]
    UnknownManifest(String),

    #[error("manifest {name:?}: {reason}")]
    Template { name: String, reason: String },

    #[error("unexpected output from `{command}`: {reason}")]
    UnexpectedOutput { command: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Kubeconfig(#[from] kube::config::KubeconfigError),

    #[error("timed out waiting for {what} after {timeout:?}")]
    WaitTimeout { what: String, timeout: Duration },

    #[error("failed waiting for {what}")]
    Wait {
        what: String,
        #[source]
        source: kube::runtime::wait::Error,
    },
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "none".to_string(),
    }
}

fn display_output(stdout: &str, stderr: &str) -> String {
    let mut out = String::new();
    for (name, text) in [("stdout", stdout), ("stderr", stderr)] {
        let text = text.trim_end();
        if !text.is_empty() {
            out.push_str(&format!("\n{name}:\n{text}"));
        }
    }
    out
}

// === impl Error ===

impl Error {
    /// The exit code of a failed command, if this error is one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::CommandFailed { code, .. } => *code,
            _ => None,
        }
    }

    /// Returns true when this is a transport-level failure of an HTTP probe.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Walks the `source` chain, rendering every message. Used to match
    /// expected failure messages such as TLS alerts that live deep inside the
    /// chain.
    pub fn chain_to_string(&self) -> String {
        let mut msg = self.to_string();
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            msg.push_str(": ");
            msg.push_str(&err.to_string());
            source = err.source();
        }
        msg
    }

    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failure_renders_code_and_streams() {
        let err = Error::CommandFailed {
            command: "false".to_string(),
            code: Some(1),
            stdout: String::new(),
            stderr: "boom\n".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "command failed (exit code 1): false\nstderr:\nboom"
        );
        assert_eq!(err.exit_code(), Some(1));
    }

    #[test]
    fn chain_includes_sources() {
        let err = Error::Transport {
            url: "http://example".to_string(),
            source: Box::new(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )),
        };
        let chain = err.chain_to_string();
        assert!(chain.starts_with("request to http://example failed"));
        assert!(chain.ends_with(": connection refused"));
        assert!(err.is_transport());
    }
}
