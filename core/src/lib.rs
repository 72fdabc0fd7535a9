pub mod config;
pub mod error;
pub mod output;
pub mod probe;
pub mod process;
pub mod provision;
pub mod registry;
pub mod status;
pub mod supervisor;

pub use error::{ProbeError, ProvisioningError, SpawnError, SpecError, StartError};
pub use registry::TunnelRegistry;
pub use status::{StatusChange, StatusListener, SubscriptionId, TunnelStatus};
pub use supervisor::{SupervisorSettings, TunnelSpec, TunnelSupervisor};

/// Interfaces that hosts and tests implement to adapt the core library
/// without pulling in platform-specific dependencies.
pub mod platform {
    use std::path::PathBuf;

    use async_trait::async_trait;

    use crate::error::ProvisioningError;

    /// Trait for platform-correct config paths.
    pub trait AppPaths {
        fn config_path(&self) -> PathBuf;
    }

    /// Produces a runnable `cloudflared` binary at a known location.
    #[async_trait]
    pub trait ExecutableProvider: Send + Sync {
        async fn ensure_executable(&self) -> Result<PathBuf, ProvisioningError>;
    }

    /// Answers whether something is listening on a local port right now.
    /// Failures and timeouts answer `false`.
    #[async_trait]
    pub trait PortProbe: Send + Sync {
        async fn is_port_active(&self, port: u16) -> bool;
    }

    /// Best-effort removal of whatever still holds a local port.
    /// Returns the number of processes signalled.
    #[async_trait]
    pub trait PortReaper: Send + Sync {
        async fn clear_port(&self, port: u16) -> usize;
    }
}
