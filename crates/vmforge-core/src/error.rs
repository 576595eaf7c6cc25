//! Error taxonomy shared by the whole workspace.
//!
//! The variants follow the failure classes from the appliance lifecycle
//! design: configuration errors are rejected before any state change,
//! resource errors come from the OS, protocol errors are fatal for the
//! current launch, guest errors carry the remote errno/message pair, and
//! external-command errors decode a child's wait status.

use std::path::PathBuf;

/// Errors that can occur anywhere in the appliance lifecycle engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resource error: {0}")]
    Resource(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("guest error (errno {errno}): {message}")]
    Guest { errno: i32, message: String },

    #[error("launch failed: {reason} (consider switching backends)")]
    LaunchFailed { reason: String },

    #[error("external command '{command}' failed: {detail}")]
    ExternalCommand { command: String, detail: String },

    #[error("no suitable appliance found on search path: {search_path}")]
    ApplianceNotFound { search_path: String },

    #[error("backend '{name}' is not available: {reason}")]
    BackendUnavailable { name: String, reason: String },

    #[error("unknown backend: {0}")]
    UnknownBackend(String),

    #[error("feature not supported: {0}")]
    NotSupported(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("handle is closed")]
    HandleClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("path could not be resolved: {0}")]
    PathResolution(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decodes a child process [`std::process::ExitStatus`] into the
/// "external command failed" error shape from the error handling design:
/// exit code if the process exited normally, otherwise the terminating
/// signal.
pub fn external_command_error(command: &str, status: std::process::ExitStatus) -> Error {
    let detail = match status.code() {
        Some(code) => format!("exited with status {code}"),
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                match status.signal() {
                    Some(sig) => format!("killed by signal {sig}"),
                    None => "terminated abnormally".to_string(),
                }
            }
            #[cfg(not(unix))]
            {
                "terminated abnormally".to_string()
            }
        }
    };
    Error::ExternalCommand {
        command: command.to_string(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_invalid_config() {
        let err = Error::InvalidConfig("too small value for memsize".to_string());
        assert!(err.to_string().contains("too small value for memsize"));
    }

    #[test]
    fn error_display_guest() {
        let err = Error::Guest {
            errno: 2,
            message: "No such file or directory".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "guest error (errno 2): No such file or directory"
        );
    }

    #[test]
    fn error_display_launch_failed_suggests_backend_switch() {
        let err = Error::LaunchFailed {
            reason: "ready sentinel never arrived".to_string(),
        };
        assert!(err.to_string().contains("switching backends"));
    }

    #[test]
    fn error_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "enoent");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Resource(_)));
    }
}
