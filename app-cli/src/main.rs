//! Command-line host for cloudflared tunnels.
//! Starts every configured tunnel and keeps it supervised until Ctrl+C.

mod app;
mod paths;

use std::sync::Arc;
use std::time::Duration;

use cloudflared_tunnel_core::platform::AppPaths;
use log::{error, info};
use tokio::sync::Notify;

use crate::app::AppState;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() {
    env_logger::init();
    info!("starting cloudflared-tunnel");

    let mut app_state = match AppState::new() {
        Ok(state) => state,
        Err(e) => {
            error!("Invalid tunnel configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!(
        "Using config at {:?} ({} tunnels)",
        app_state.paths.config_path(),
        app_state.config.tunnels.len()
    );

    // Ctrl+C cleanup
    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("received signal, stopping tunnels and exiting");
            shutdown.notify_one();
        }) {
            error!("Error setting Ctrl-C handler: {}", e);
        }
    }

    app_state.start_all().await;

    let mut ticker = tokio::time::interval(SUMMARY_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            _ = ticker.tick() => app_state.log_summary(),
        }
    }

    info!("exiting; cleaning up");
    app_state.cleanup().await;
}
