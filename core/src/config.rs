//! Configuration loading and management.
//! Uses injected `AppPaths` so hosts control where files live.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::platform::{AppPaths, ExecutableProvider};
use crate::provision::{FixedExecutable, PathLookup};
use crate::supervisor::{SupervisorSettings, TunnelSpec};

// Helper struct for serialization to maintain TOML structure
#[derive(Serialize)]
struct ConfigForSerialization {
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    executable: Option<PathBuf>,
    supervisor: SupervisorConfig,
    // toml's preserve_order keeps the file order of this map
    tunnels: toml::map::Map<String, toml::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub hostname: String,
    pub port: u16,
    /// Service token id; its presence marks the tunnel as protected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl TunnelConfig {
    /// Display name, falling back to the hostname.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.hostname)
    }
}

/// Supervisor timings, all in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub reconcile_interval_secs: u64,
    pub restart_cooldown_secs: u64,
    pub stop_grace_secs: u64,
    pub startup_probe_secs: u64,
    pub spawn_attempts: u32,
    pub spawn_retry_delay_secs: u64,
    pub clear_port_on_stop: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        let settings = SupervisorSettings::default();
        Self {
            reconcile_interval_secs: settings.reconcile_interval.as_secs(),
            restart_cooldown_secs: settings.restart_cooldown.as_secs(),
            stop_grace_secs: settings.stop_grace.as_secs(),
            startup_probe_secs: settings.startup_probe.as_secs(),
            spawn_attempts: settings.spawn_attempts,
            spawn_retry_delay_secs: settings.spawn_retry_delay.as_secs(),
            clear_port_on_stop: settings.clear_port_on_stop,
        }
    }
}

impl SupervisorConfig {
    pub fn to_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            // A zero interval would make tokio's interval panic.
            reconcile_interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            restart_cooldown: Duration::from_secs(self.restart_cooldown_secs),
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            startup_probe: Duration::from_secs(self.startup_probe_secs),
            spawn_attempts: self.spawn_attempts.max(1),
            spawn_retry_delay: Duration::from_secs(self.spawn_retry_delay_secs),
            clear_port_on_stop: self.clear_port_on_stop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub tunnels: Vec<(String, TunnelConfig)>,
    pub supervisor: SupervisorConfig,
    pub path: Option<String>,
    pub executable: Option<PathBuf>,
}

impl Config {
    /// Load configuration from the provided paths. Creates a default file if missing.
    pub fn load_with(paths: &dyn AppPaths) -> Result<Self, Box<dyn std::error::Error>> {
        let config_path = paths.config_path();

        if !config_path.exists() {
            info!(
                "Config file not found at {:?}, creating default config",
                config_path
            );
            let default_config = Self::default();
            default_config.save_with(paths)?;
            return Ok(default_config);
        }

        debug!("Loading config from {:?}", config_path);
        let content = fs::read_to_string(&config_path)?;
        let config = Self::parse(&content)?;

        info!("Loaded {} tunnel configurations", config.tunnels.len());
        Ok(config)
    }

    /// Parse configuration text, keeping tunnel order.
    pub fn parse(content: &str) -> Result<Self, Box<dyn std::error::Error>> {
        // Parse as toml::Value first to preserve order, then convert
        let value: toml::Value = content.parse()?;
        Self::from_toml_value(value)
    }

    /// Save configuration to the provided paths.
    pub fn save_with(&self, paths: &dyn AppPaths) -> Result<(), Box<dyn std::error::Error>> {
        let config_path = paths.config_path();

        // Create the directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tunnels = toml::map::Map::new();
        for (key, tunnel) in &self.tunnels {
            tunnels.insert(key.clone(), toml::Value::try_from(tunnel)?);
        }

        let serializable_config = ConfigForSerialization {
            path: self.path.clone(),
            executable: self.executable.clone(),
            supervisor: self.supervisor.clone(),
            tunnels,
        };
        let content = toml::to_string_pretty(&serializable_config)?;
        fs::write(&config_path, content)?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Validated tunnel specs, keyed like the config, in file order.
    pub fn to_specs(&self) -> Result<Vec<(String, TunnelSpec)>, Box<dyn std::error::Error>> {
        self.tunnels
            .iter()
            .map(|(key, tunnel)| {
                TunnelSpec::new(tunnel.hostname.clone(), tunnel.port, tunnel.token.clone())
                    .map(|spec| (key.clone(), spec))
                    .map_err(|e| format!("tunnel '{}': {}", key, e).into())
            })
            .collect()
    }

    /// Return configured PATH or fall back to current process PATH.
    pub fn get_path(&self) -> String {
        if let Some(path) = &self.path {
            return path.clone();
        }
        std::env::var("PATH").unwrap_or_default()
    }

    /// The explicit binary if configured, otherwise a lookup on the configured PATH.
    pub fn executable_provider(&self) -> Arc<dyn ExecutableProvider> {
        match &self.executable {
            Some(path) => Arc::new(FixedExecutable::new(path.clone())),
            None => Arc::new(PathLookup::new(self.get_path())),
        }
    }

    /// Convert from toml::Value preserving order
    fn from_toml_value(value: toml::Value) -> Result<Self, Box<dyn std::error::Error>> {
        let table = value.as_table().ok_or("Root must be a table")?;

        let path = table
            .get("path")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        let executable = table
            .get("executable")
            .and_then(|v| v.as_str())
            .map(PathBuf::from);

        let supervisor = match table.get("supervisor") {
            Some(value) => value.clone().try_into()?,
            None => SupervisorConfig::default(),
        };

        let mut tunnels = Vec::new();

        if let Some(tunnels_value) = table.get("tunnels")
            && let Some(tunnels_table) = tunnels_value.as_table()
        {
            // With preserve_order feature, this iteration maintains order
            for (key, value) in tunnels_table {
                let tunnel_config: TunnelConfig = value.clone().try_into()?;
                tunnels.push((key.clone(), tunnel_config));
            }
        }

        Ok(Config {
            tunnels,
            supervisor,
            path,
            executable,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        let tunnels = vec![(
            "home-assistant".to_string(),
            TunnelConfig {
                name: Some("Home Assistant".to_string()),
                hostname: "ha.example.com".to_string(),
                port: 8123,
                token: None,
            },
        )];

        Self {
            tunnels,
            supervisor: SupervisorConfig::default(),
            path: None,
            executable: None,
        }
    }
}
