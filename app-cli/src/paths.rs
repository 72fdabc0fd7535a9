use std::path::PathBuf;

use cloudflared_tunnel_core::platform::AppPaths;

/// XDG-style locations, e.g. `~/.config/cloudflared_tunnel/config.toml`.
#[derive(Default)]
pub struct CliPaths;

impl AppPaths for CliPaths {
    fn config_path(&self) -> PathBuf {
        if let Some(path) = std::env::var_os("CLOUDFLARED_TUNNEL_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cloudflared_tunnel")
            .join("config.toml")
    }
}
