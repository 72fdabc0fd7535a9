//! Executable providers: where the `cloudflared` binary comes from.
//! Downloading is out of scope; providers only locate and verify a binary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::{debug, info};

use crate::error::ProvisioningError;
use crate::platform::ExecutableProvider;

pub const BINARY_NAME: &str = if cfg!(windows) {
    "cloudflared.exe"
} else {
    "cloudflared"
};

/// A binary at a configured location.
#[derive(Debug, Clone)]
pub struct FixedExecutable {
    path: PathBuf,
}

impl FixedExecutable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ExecutableProvider for FixedExecutable {
    async fn ensure_executable(&self) -> Result<PathBuf, ProvisioningError> {
        if !self.path.exists() {
            return Err(ProvisioningError::new(format!(
                "{} does not exist",
                self.path.display()
            )));
        }
        if !is_executable(&self.path) {
            return Err(ProvisioningError::new(format!(
                "{} is not executable",
                self.path.display()
            )));
        }
        debug!("Using cloudflared at {}", self.path.display());
        Ok(self.path.clone())
    }
}

/// Searches a `PATH`-style list of directories for the binary.
#[derive(Debug, Clone)]
pub struct PathLookup {
    binary: String,
    search_path: String,
}

impl PathLookup {
    pub fn new(search_path: impl Into<String>) -> Self {
        Self {
            binary: BINARY_NAME.to_string(),
            search_path: search_path.into(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// First runnable match, in search order.
    pub fn find(&self) -> Option<PathBuf> {
        std::env::split_paths(&self.search_path)
            .map(|dir| dir.join(&self.binary))
            .find(|candidate| candidate.is_file() && is_executable(candidate))
    }
}

#[async_trait]
impl ExecutableProvider for PathLookup {
    async fn ensure_executable(&self) -> Result<PathBuf, ProvisioningError> {
        match self.find() {
            Some(path) => {
                info!("Found {} at {}", self.binary, path.display());
                Ok(path)
            }
            None => Err(ProvisioningError::new(format!(
                "{} not found on PATH ({})",
                self.binary, self.search_path
            ))),
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
