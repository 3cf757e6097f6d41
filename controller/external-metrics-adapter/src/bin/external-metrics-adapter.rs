//! External Metrics Adapter binary - serves CAQL query results as external metrics

use anyhow::Context;
use external_metrics_adapter::{
    server, CirconusClientFactory, ClientCache, Config, ConfigSource, ConfigStore,
    DirectoryConfigSource, ExternalMetricsProvider, Metrics, MetricsProvider, QueryExecutor,
    RefreshLoop,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let config = Config::parse_config();

    // Initialize logging
    if config.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .init();
    }

    info!("Starting External Metrics Adapter");
    info!("Configuration:");
    info!("  Circonus API URL: {}", config.api_url);
    info!("  Config directory: {}", config.config_dir);
    info!("  Refresh interval: {:?}", config.refresh_interval());
    info!("  Query timeout: {:?}", config.query_timeout());
    info!("  Listen address: {}", config.listen_addr);

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.listen_addr))?;

    let metrics = Metrics;
    let store = ConfigStore::new(metrics);
    let source: Arc<dyn ConfigSource> =
        Arc::new(DirectoryConfigSource::new(config.config_dir.clone()));

    // Load what is available before serving so known metrics resolve immediately
    if let Err(e) = store.refresh(source.as_ref()).await {
        warn!(error = %e, "Initial configuration refresh failed, continuing with empty configuration");
    }

    let refresher = RefreshLoop::spawn(store.clone(), source, config.refresh_interval());

    let factory = CirconusClientFactory::new(config.app_name.clone(), config.query_timeout());
    let clients = Arc::new(ClientCache::new(factory, metrics));
    let executor = QueryExecutor::new(
        store,
        clients,
        config.api_url.clone(),
        config.query_timeout(),
        metrics,
    );
    let provider: Arc<dyn MetricsProvider> = Arc::new(ExternalMetricsProvider::new(executor));

    let result = server::serve(addr, provider, shutdown_signal()).await;

    refresher.shutdown().await;
    info!("External Metrics Adapter stopped");
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
