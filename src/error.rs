use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::services::process::ProcessRole;

/// Failures that abort the startup sequence.
///
/// Every variant maps to exit status 1; the container runtime only sees the
/// status, the variant text is what lands in the logs.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("failed to write SSH private key to {path}: {source}")]
    KeyMaterial {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("SSH_PRIVATE_KEY is empty and no key file exists at {0}")]
    MissingPrivateKey(PathBuf),
    #[error("failed to start {role} process: {source}")]
    Spawn {
        role: ProcessRole,
        source: std::io::Error,
    },
    #[error("startup timed out in {phase} after {waited:?}")]
    TimedOut { phase: &'static str, waited: Duration },
    #[error("proxy process {name:?} is not running after the grace period")]
    ProxyNotRunning { name: String },
    #[error("{role} process failed: {source}")]
    Process {
        role: ProcessRole,
        source: std::io::Error,
    },
    #[error("{role} process exited during startup with {status}")]
    Exited {
        role: ProcessRole,
        status: std::process::ExitStatus,
    },
    #[error("SSH tunnel could not be established: {0}")]
    Tunnel(String),
    #[error("failed to update readiness sentinel {path}: {source}")]
    Sentinel {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl StartupError {
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Translate a child's exit status into the code this process should exit with.
pub fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }

    1
}
