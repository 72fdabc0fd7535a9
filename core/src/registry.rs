//! Host-owned collection of tunnel supervisors, keyed by entry id.

use log::{info, warn};

use crate::config::Config;
use crate::error::StartError;
use crate::supervisor::TunnelSupervisor;

/// A named supervisor as held by the registry.
#[derive(Clone)]
pub struct TunnelEntry {
    pub key: String,
    pub name: String,
    pub supervisor: TunnelSupervisor,
}

/// Supervisors in insertion order. At most one per key.
#[derive(Default)]
pub struct TunnelRegistry {
    entries: Vec<TunnelEntry>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One supervisor per configured tunnel, in file order.
    pub fn from_config(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        let provider = config.executable_provider();
        let settings = config.supervisor.to_settings();
        let path = config.get_path();

        let mut registry = Self::new();
        for ((key, spec), (_, tunnel)) in config.to_specs()?.into_iter().zip(&config.tunnels) {
            let supervisor = TunnelSupervisor::builder(spec, provider.clone())
                .settings(settings.clone())
                .path_env(path.clone())
                .build();
            let name = tunnel.display_name().to_string();
            if registry.insert(key.clone(), name, supervisor).is_some() {
                return Err(format!("duplicate tunnel key '{}'", key).into());
            }
        }
        Ok(registry)
    }

    /// Adds or replaces the supervisor for `key`. A replaced supervisor is
    /// returned still running; the caller decides whether to shut it down.
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        name: impl Into<String>,
        supervisor: TunnelSupervisor,
    ) -> Option<TunnelSupervisor> {
        let entry = TunnelEntry {
            key: key.into(),
            name: name.into(),
            supervisor,
        };
        match self.entries.iter_mut().find(|e| e.key == entry.key) {
            Some(existing) => {
                let replaced = std::mem::replace(existing, entry);
                Some(replaced.supervisor)
            }
            None => {
                self.entries.push(entry);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&TunnelSupervisor> {
        self.entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| &e.supervisor)
    }

    /// Removes the entry and shuts its supervisor down.
    pub async fn remove(&mut self, key: &str) -> bool {
        let Some(index) = self.entries.iter().position(|e| e.key == key) else {
            return false;
        };
        let entry = self.entries.remove(index);
        entry.supervisor.shutdown().await;
        info!("Removed tunnel '{}'", entry.key);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &TunnelEntry> {
        self.entries.iter()
    }

    /// Starts every tunnel. One failure does not prevent the others.
    pub async fn start_all(&self) -> Vec<(String, StartError)> {
        let mut failures = Vec::new();
        for entry in &self.entries {
            if let Err(e) = entry.supervisor.start().await {
                warn!("Tunnel '{}' failed to start: {}", entry.name, e);
                failures.push((entry.key.clone(), e));
            }
        }
        failures
    }

    pub async fn stop_all(&self) {
        for entry in &self.entries {
            entry.supervisor.stop().await;
        }
    }

    /// Stops every tunnel and drops all entries.
    pub async fn shutdown(&mut self) {
        for entry in self.entries.drain(..) {
            entry.supervisor.shutdown().await;
        }
    }
}
