use std::fmt;
use std::time::Duration;

/// Structured error returned by every [`RuntimeBackend`](super::RuntimeBackend) call.
///
/// The engine never inspects backend errors beyond [`BackendError::is_not_found`];
/// it wraps them into the lifecycle error kinds with the service name attached.
#[derive(Debug)]
pub enum BackendError {
    /// Backend command timed out.
    Timeout { command: String, timeout: Duration },

    /// Backend command ran but returned a non-zero exit.
    CommandFailed {
        command: String,
        stderr: String,
        exit_code: Option<i32>,
    },

    /// Backend binary couldn't be executed (not in PATH, permission denied).
    ExecFailed {
        command: String,
        source: std::io::Error,
    },

    /// Sandbox or unit doesn't exist.
    NotFound { id: String },

    /// Backend daemon not responding.
    Unavailable { reason: String },

    /// Operation not supported by this backend (e.g. checkpoint without CRIU).
    Unsupported { operation: String },

    /// Any other failure reported by the backend.
    Other(String),
}

impl BackendError {
    /// Create a timeout error.
    pub fn timeout(cmd: impl Into<String>, dur: Duration) -> Self {
        BackendError::Timeout {
            command: cmd.into(),
            timeout: dur,
        }
    }

    /// Create a command-failed error from an `std::process::Output`.
    pub fn failed(cmd: impl Into<String>, output: &std::process::Output) -> Self {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        BackendError::CommandFailed {
            command: cmd.into(),
            stderr,
            exit_code: output.status.code(),
        }
    }

    /// Create an exec-failed error (binary not found / permission denied).
    pub fn exec_failed(cmd: impl Into<String>, err: std::io::Error) -> Self {
        BackendError::ExecFailed {
            command: cmd.into(),
            source: err,
        }
    }

    pub fn not_found(id: impl Into<String>) -> Self {
        BackendError::NotFound { id: id.into() }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        BackendError::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn other(msg: impl Into<String>) -> Self {
        BackendError::Other(msg.into())
    }

    /// True if the target object is already gone.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Timeout { command, timeout } => {
                write!(f, "Timed out running '{}' (exceeded {:?})", command, timeout)
            }
            BackendError::CommandFailed {
                command,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    write!(f, "'{}' failed (exit code {}): {}", command, code, stderr)
                } else {
                    write!(f, "'{}' failed: {}", command, stderr)
                }
            }
            BackendError::ExecFailed { command, source } => {
                write!(f, "Failed to execute '{}': {}", command, source)
            }
            BackendError::NotFound { id } => write!(f, "No such object: {}", id),
            BackendError::Unavailable { reason } => {
                write!(f, "Runtime backend is not available: {}", reason)
            }
            BackendError::Unsupported { operation } => {
                write!(f, "Operation '{}' is not supported by this backend", operation)
            }
            BackendError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BackendError::ExecFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
