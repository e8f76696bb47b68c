mod api;
mod config;

use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use service_search::{
    CloudDiscoveryProvider, HttpCloudDirectory, MdnsDiscoveryProvider, MdnsServiceBrowser,
    SearchEvent, ServiceSearch, Subscription, Topic,
};
use tokio_util::sync::CancellationToken;
use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("searchd=info,service_search=info"))
        )
        .init();

    tracing::info!("Starting searchd");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "/etc/searchd/searchd.toml".to_string());

    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    tracing::info!("Loaded config from {}", config_path);

    let mdns_daemon = ServiceDaemon::new()
        .context("Failed to create mDNS daemon")?;
    if let Some(interface) = &config.search.interface {
        mdns_daemon
            .disable_interface(mdns_sd::IfKind::All)
            .context("Failed to disable default interfaces")?;
        mdns_daemon
            .enable_interface(interface.as_str())
            .with_context(|| format!("Failed to enable interface {}", interface))?;
    }

    let browser = Arc::new(MdnsServiceBrowser::new(mdns_daemon.clone()));
    let mut builder = ServiceSearch::builder()
        .config(config.search_config())
        .provider(MdnsDiscoveryProvider::factory(browser, config.mdns_config()));

    if let Some(id) = &config.search.target_id {
        tracing::info!("Searching for service {} only", id);
        builder = builder.target_id(id.clone());
    }

    if config.cloud.enabled {
        let url = config
            .cloud
            .directory_url
            .clone()
            .context("cloud.directory_url is not set")?;
        tracing::info!("Polling cloud directory {}", url);
        let directory = Arc::new(HttpCloudDirectory::new(
            url,
            Duration::from_secs(config.timeouts.descriptor_secs),
        ));
        builder = builder.provider(CloudDiscoveryProvider::factory(directory, config.cloud_config()));
    }

    let search = builder.spawn();

    let cancel = CancellationToken::new();

    // Log every notification
    let events = search.subscribe(&Topic::ALL);
    let logger_cancel = cancel.clone();
    let logger_handle = tokio::spawn(log_events(events, logger_cancel));

    search.start().context("Failed to start search")?;

    let app_state = api::routes::AppState::new(search.clone(), config.search.target_id.clone());
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

    if let Err(e) = search.stop() {
        tracing::error!("Failed to stop search: {}", e);
    }
    cancel.cancel();

    let _ = tokio::join!(logger_handle, server_handle);

    if let Err(e) = search.shutdown() {
        tracing::error!("Failed to shut down search: {}", e);
    }

    if let Err(e) = mdns_daemon.shutdown() {
        tracing::error!("Failed to shutdown mDNS daemon: {}", e);
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn log_events(mut events: Subscription, cancel: CancellationToken) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(SearchEvent::Started) => tracing::info!("Search started"),
                Some(SearchEvent::Stopped) => tracing::info!("Search stopped"),
                Some(SearchEvent::ServiceFound(service)) => {
                    tracing::info!(id = service.id, kind = %service.kind, "Found {} at {}", service.name, service.uri);
                }
                Some(SearchEvent::ServiceLost(service)) => {
                    tracing::info!(id = service.id, kind = %service.kind, "Lost {} at {}", service.name, service.uri);
                }
                None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
}
