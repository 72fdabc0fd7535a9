// Shared host state: the loaded config and the supervisors built from it.

use std::sync::Arc;

use chrono::Local;
use log::{error, info, warn};

use cloudflared_tunnel_core::config::Config;
use cloudflared_tunnel_core::{StatusChange, StatusListener, TunnelRegistry, TunnelStatus};

use crate::paths::CliPaths;

pub struct AppState {
    pub paths: Arc<CliPaths>,
    pub config: Config,
    pub registry: TunnelRegistry,
}

impl AppState {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        let paths = Arc::new(CliPaths);

        let config = match Config::load_with(paths.as_ref()) {
            Ok(config) => {
                info!("Loaded configuration successfully");
                config
            }
            Err(e) => {
                error!("Failed to load configuration: {}", e);
                warn!("Using default configuration");
                Config::default()
            }
        };

        let registry = TunnelRegistry::from_config(&config)?;
        for entry in registry.iter() {
            entry.supervisor.subscribe_status(Arc::new(StatusLogger {
                label: format!("{} ({})", entry.name, entry.key),
            }));
        }

        Ok(Self {
            paths,
            config,
            registry,
        })
    }

    pub async fn start_all(&self) {
        let failures = self.registry.start_all().await;
        info!(
            "Started {} of {} tunnels",
            self.registry.len() - failures.len(),
            self.registry.len()
        );
    }

    /// One line per tunnel with its status and last automatic restart.
    pub fn log_summary(&self) {
        for entry in self.registry.iter() {
            let supervisor = &entry.supervisor;
            info!(
                "{} -> {}:{} [{}] last restart: {}",
                entry.name,
                supervisor.hostname(),
                supervisor.port(),
                supervisor.status_string(),
                supervisor.last_restart_description()
            );
        }
    }

    /// Stops every tunnel. Called on exit.
    pub async fn cleanup(&mut self) {
        self.registry.shutdown().await;
    }
}

struct StatusLogger {
    label: String,
}

impl StatusListener for StatusLogger {
    fn on_status(&self, change: &StatusChange) {
        let at = change.at.with_timezone(&Local).format("%H:%M:%S");
        match &change.current {
            TunnelStatus::Error(message) => {
                warn!("[{}] {} error: {}", at, self.label, message)
            }
            current => info!("[{}] {} {} -> {}", at, self.label, change.previous, current),
        }
    }

    fn name(&self) -> &str {
        &self.label
    }
}
