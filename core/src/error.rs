//! Error types raised by the tunnel supervisor and its collaborators.
//!
//! - [`SpawnError`]: the OS refused to create the tunnel process.
//! - [`StartError`]: a `start()` call failed (includes authentication failures).
//! - [`ProvisioningError`]: no runnable `cloudflared` binary is available.
//! - [`ProbeError`]: a port-liveness query failed; callers degrade it to "unknown".
//! - [`SpecError`]: a tunnel definition is invalid.
//!
//! Unexpected process termination is not an error type: it is observed
//! asynchronously and surfaces as a status change (see `output::OutputSignal`).

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Failure to create the tunnel process.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SpawnError {
    #[error("executable not found: {}", .path.display())]
    NotFound { path: PathBuf },

    #[error("executable is not runnable: {}", .path.display())]
    PermissionDenied { path: PathBuf },

    /// Another writer still holds the binary open (ETXTBSY). Transient.
    #[error("executable is busy (text file busy): {}", .path.display())]
    Busy { path: PathBuf },

    #[error("failed to spawn {}: {source}", .path.display())]
    Os {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to capture {stream} of the tunnel process")]
    MissingPipe { stream: &'static str },
}

impl SpawnError {
    /// Maps an OS error from `spawn` onto the taxonomy.
    pub fn from_io(path: &Path, err: io::Error) -> Self {
        let path = path.to_path_buf();
        if is_text_file_busy(&err) {
            return SpawnError::Busy { path };
        }

        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::NotFound { path },
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { path },
            _ => SpawnError::Os { path, source: err },
        }
    }

    /// Whether another spawn attempt may succeed without any intervention.
    pub fn is_transient(&self) -> bool {
        matches!(self, SpawnError::Busy { .. })
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SpawnError::NotFound { .. } => "spawn_not_found",
            SpawnError::PermissionDenied { .. } => "spawn_permission_denied",
            SpawnError::Busy { .. } => "spawn_busy",
            SpawnError::Os { .. } => "spawn_os",
            SpawnError::MissingPipe { .. } => "spawn_missing_pipe",
        }
    }
}

#[cfg(unix)]
fn is_text_file_busy(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ETXTBSY)
}

#[cfg(not(unix))]
fn is_text_file_busy(_err: &io::Error) -> bool {
    false
}

/// The executable collaborator could not produce a runnable binary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cloudflared unavailable: {reason}")]
pub struct ProvisioningError {
    pub reason: String,
}

impl ProvisioningError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Failure of a `start()` call.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StartError {
    /// The service token was rejected. Restarting with the same token cannot succeed.
    #[error("token authentication failed: {message}")]
    Authentication { message: String },

    /// The tunnel reported an error right after launch.
    #[error("tunnel error: {message}")]
    Rejected { message: String },

    /// The process closed its output before reporting anything useful.
    #[error("cloudflared exited during startup ({status})")]
    ExitedEarly { status: String },

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("failed to spawn cloudflared after {attempts} attempt(s): {source}")]
    Spawn {
        attempts: u32,
        #[source]
        source: SpawnError,
    },
}

impl StartError {
    pub fn is_authentication(&self) -> bool {
        matches!(self, StartError::Authentication { .. })
    }

    /// The message recorded as the tunnel's last error.
    ///
    /// For tunnel-reported failures this is the tool's own message, so the
    /// status reads `error: failed to connect` rather than a wrapped form.
    pub fn status_message(&self) -> String {
        match self {
            StartError::Authentication { message } => {
                format!("token authentication failed: {message}")
            }
            StartError::Rejected { message } => message.clone(),
            other => other.to_string(),
        }
    }

    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            StartError::Authentication { .. } => "start_authentication",
            StartError::Rejected { .. } => "start_rejected",
            StartError::ExitedEarly { .. } => "start_exited_early",
            StartError::Provisioning(_) => "start_provisioning",
            StartError::Spawn { .. } => "start_spawn",
        }
    }
}

/// A port-liveness query failed. Never propagated past the probe.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("listener query timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to read listener table: {0}")]
    Io(#[from] io::Error),

    #[error("listener query failed: {0}")]
    Query(String),
}

/// An invalid tunnel definition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("hostname must not be empty")]
    EmptyHostname,

    #[error("local port must be between 1 and 65535")]
    InvalidPort,
}
