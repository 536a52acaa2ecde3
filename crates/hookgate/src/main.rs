use std::sync::Arc;

use anyhow::Context;
use hookgate_bridge::{BridgeConfig, BridgeEngine};
use hookgate_core::{
    config::{Config, DbDriver},
    queue::QueuePublisher,
    reconcile::reconcile,
    session::SessionManager,
    store::{memory::InMemoryTenantStore, port::TenantStore},
    webhook::{WebhookClient, WebhookClientOptions},
};
use hookgate_redis::RedisQueuePublisher;
use hookgate_sqlite::SqliteTenantStore;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load().context("failed to load configuration")?;
    hookgate_core::logging::init("hookgate", cfg.log_format)?;

    let store: Arc<dyn TenantStore> = match cfg.db_driver {
        DbDriver::Sqlite => Arc::new(
            SqliteTenantStore::open(&cfg.db_path)
                .with_context(|| format!("failed to open {}", cfg.db_path.display()))?,
        ),
        DbDriver::Memory => {
            warn!("using in-memory tenant store; nothing survives a restart");
            Arc::new(InMemoryTenantStore::new())
        }
    };

    let queue: Option<Arc<dyn QueuePublisher>> = match RedisQueuePublisher::from_config(&cfg)? {
        Some(publisher) => {
            info!(key = publisher.key(), "queue publishing enabled");
            Some(Arc::new(publisher))
        }
        None => {
            info!("REDIS_URI not set; queue publishing disabled");
            None
        }
    };

    let webhook = Arc::new(WebhookClient::new(&WebhookClientOptions {
        timeout: cfg.webhook_timeout,
        max_redirects: cfg.webhook_max_redirects,
        accept_invalid_certs: cfg.webhook_insecure_tls,
    })?);
    if cfg.webhook_insecure_tls {
        warn!("webhook TLS certificate verification is disabled");
    }

    let engine = Arc::new(BridgeEngine::new(BridgeConfig::from_config(&cfg)));

    let manager = SessionManager::new(&cfg, engine, store, queue, webhook);

    let report = reconcile(&manager)
        .await
        .context("failed to restore connected sessions")?;
    info!(
        instance = %cfg.instance,
        started = report.started.len(),
        skipped = report.skipped.len(),
        failed = report.failed.len(),
        "startup reconciliation finished"
    );
    for (tenant_id, error) in &report.failed {
        warn!(%tenant_id, %error, "session not restored");
    }

    shutdown_signal().await;
    manager.shutdown().await;
    info!("bye");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
                return;
            }
            Err(e) => warn!(error = %e, "SIGTERM handler unavailable"),
        }
    }
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "ctrl-c handler failed; shutting down");
    }
}
