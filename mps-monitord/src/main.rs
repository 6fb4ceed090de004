mod api;
mod cache;
mod config;
mod error;
mod mdns;
mod poll;
mod record;
mod registry;
mod rpc;
mod selection;
#[cfg(test)]
mod testing;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use mdns_sd::ServiceDaemon;
use anyhow::{Context, Result};
use crate::config::Config;
use crate::poll::PollCoordinator;
use crate::registry::{RegistryEvent, RegistryHandle};
use crate::selection::Selection;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mps_monitord=info"))
        )
        .init();

    tracing::info!("Starting mps-monitord");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/mps-monitor/monitord.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.discovery.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let cancel = CancellationToken::new();
    let registry = RegistryHandle::spawn(config.poll.record_settings());
    let selection = Selection::new(config.selection.observer_capacity);

    // Browser -> registry
    let (browser_tx, browser_rx) = mpsc::channel(256);
    let browser_cancel = cancel.clone();
    let browser_daemon = mdns_daemon.clone();
    let service_types = config.discovery.service_types.clone();
    let browser_handle = tokio::spawn(async move {
        if let Err(e) = mdns::browser::run_browser(browser_daemon, service_types, browser_tx, browser_cancel).await {
            tracing::error!("mDNS browser error: {}", e);
        }
    });
    let discovery_handle = registry.start_discovery(browser_rx, cancel.clone());

    // Drop the selection when its portal disappears
    let mut registry_events = registry.subscribe();
    let forget_selection = selection.clone();
    let forget_cancel = cancel.clone();
    let forget_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = registry_events.recv() => match event {
                    Ok(RegistryEvent::Removed(identity)) => forget_selection.forget(&identity),
                    Ok(RegistryEvent::Added(_)) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Missed {} registry events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = forget_cancel.cancelled() => break,
            }
        }
    });

    let (poll, view_rx) = PollCoordinator::new(registry.clone(), config.poll.poll_settings());
    let poll_handle = tokio::spawn(poll.run(cancel.clone()));

    let app_state = api::routes::AppState {
        registry: registry.clone(),
        selection: selection.clone(),
        view_rx,
        shutdown: cancel.clone(),
    };
    let app = api::routes::router(app_state);

    let listener = tokio::net::TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;

    tracing::info!("API listening on {}", config.api.listen);

    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutdown signal received");

    cancel.cancel();

    let _ = tokio::join!(browser_handle, discovery_handle, forget_handle, poll_handle, server_handle);

    selection.select_record(None);
    if let Err(e) = registry.dispose().await {
        tracing::error!("Failed to dispose registry: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
