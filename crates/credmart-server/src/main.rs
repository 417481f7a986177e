//! credmart-server: HTTP entry point for the marketplace service.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use credmart::notify::WebhookConfig;
use credmart::service::{ServiceConfig, Stores};
use credmart::transport::{ServerConfig, serve};
use credmart::{
    AppConfig, GatewayConfig, GatewayConnector, Health, LogNotifier, MarketService, MemoryStore,
    Notifier, WebhookNotifier,
};

/// Initialize tracing with CREDMART_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("CREDMART_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("credmart={level},credmart_server={level}"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

fn build_notifier(config: &AppConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match config.notify_url {
        Some(ref url) => {
            let webhook = WebhookConfig {
                auth_token: config.notify_token.clone(),
                ..WebhookConfig::default()
            };
            let notifier = WebhookNotifier::new(url.clone(), webhook)
                .context("failed to build notification webhook client")?;
            tracing::info!(url = %notifier.url(), "Notifications go to webhook");
            Ok(Arc::new(notifier))
        }
        None => {
            tracing::warn!("CREDMART_NOTIFY_URL not set, notifications are only logged");
            Ok(Arc::new(LogNotifier))
        }
    }
}

async fn load_store(config: &AppConfig) -> anyhow::Result<Arc<MemoryStore>> {
    let Some(ref path) = config.snapshot_path else {
        tracing::warn!("CREDMART_SNAPSHOT_PATH not set, state will not survive restart");
        return Ok(Arc::new(MemoryStore::new()));
    };
    let store = MemoryStore::load_from(path)
        .await
        .with_context(|| format!("failed to load snapshot {}", path.display()))?;
    match store {
        Some(store) => {
            tracing::info!(path = %path.display(), "Restored state from snapshot");
            Ok(Arc::new(store))
        }
        None => {
            tracing::info!(path = %path.display(), "No snapshot yet, starting empty");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let store = load_store(&config).await?;
    let notifier = build_notifier(&config)?;
    let gateway = Arc::new(
        GatewayConnector::new(GatewayConfig::new(config.gateway_url.clone()))
            .context("failed to build session gateway client")?,
    );

    let mut service = MarketService::new(
        Stores::memory(&store),
        gateway.clone(),
        notifier,
        ServiceConfig {
            discount_amount: Some(config.discount_amount),
            registry: config.registry(),
        },
    )
    .with_gateway(gateway);
    if let Some(ref path) = config.snapshot_path {
        service = service.with_snapshot(store.clone(), path.clone());
    }
    let service = Arc::new(service);

    if config.snapshot_path.is_some() {
        let periodic = service.clone();
        let interval = config.snapshot_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = periodic.snapshot().await {
                    tracing::error!(error = %e, "Periodic snapshot failed");
                }
            }
        });
    }

    service.set_health(Health::Ready).await;
    tracing::info!(
        gateway = %config.gateway_url,
        admins = config.admin_ids.len(),
        "credmart ready"
    );

    serve(ServerConfig::from(&config), service).await
}
