//! Startup reconciliation: bring back every tenant persisted as connected.

use tracing::{info, warn};

use crate::{
    domain::{CachedTenantInfo, TenantId},
    errors::Error,
    session::{SessionManager, StartOutcome, StartRequest},
    utils::token_fingerprint,
    Result,
};

#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub started: Vec<TenantId>,
    /// A session already existed for these tenants.
    pub skipped: Vec<TenantId>,
    pub failed: Vec<(TenantId, String)>,
}

/// Start one session per connected tenant of this instance. Per-tenant failures are
/// collected; only a failure to list tenants aborts.
pub async fn reconcile(manager: &SessionManager) -> Result<ReconcileReport> {
    let instance = manager.instance();
    if instance.trim().is_empty() {
        return Err(Error::Config(
            "instance label is required to restore sessions".to_string(),
        ));
    }

    let tenants = manager.store().list_connected(instance).await?;
    info!(instance, count = tenants.len(), "restoring connected sessions");

    let mut report = ReconcileReport::default();
    for rec in tenants {
        let info = CachedTenantInfo::from(&rec);
        manager.cache().set(info.clone()).await;
        let req = StartRequest::new(info);
        match manager.start(req).await {
            Ok(StartOutcome::Started { .. }) => {
                info!(tenant_id = %rec.id, token = %token_fingerprint(&rec.token), "session restored");
                report.started.push(rec.id);
            }
            Ok(_) => report.skipped.push(rec.id),
            Err(e) => {
                warn!(tenant_id = %rec.id, error = %e, "could not restore session");
                report.failed.push((rec.id, e.to_string()));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::NewTenant,
        registry::SessionState,
        store::{memory::InMemoryTenantStore, port::TenantStore},
        test_support::{test_config, FakeEngine, RecordingWebhook},
    };
    use std::{sync::Arc, time::Duration};

    async fn tenant(
        store: &InMemoryTenantStore,
        token: &str,
        identity: &str,
        connected: bool,
    ) -> TenantId {
        let id = store
            .create_tenant(NewTenant {
                token: token.to_string(),
                instance: "hookgate".to_string(),
                events: "Message,Bogus".to_string(),
                ..NewTenant::default()
            })
            .await
            .unwrap();
        store.set_device_identity(id, identity).await.unwrap();
        if connected {
            store.set_connected(id).await.unwrap();
        }
        id
    }

    fn manager(
        dir: &std::path::Path,
        store: Arc<InMemoryTenantStore>,
        engine: Arc<FakeEngine>,
    ) -> SessionManager {
        SessionManager::new(
            &test_config(dir),
            engine,
            store,
            None,
            RecordingWebhook::new(),
        )
    }

    #[tokio::test]
    async fn starts_only_connected_tenants() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTenantStore::new());
        let a = tenant(&store, "a", "1@s.whatsapp.net", true).await;
        let b = tenant(&store, "b", "2@s.whatsapp.net", true).await;
        let c = tenant(&store, "c", "3@s.whatsapp.net", false).await;
        let engine = FakeEngine::new();
        let mgr = manager(dir.path(), store.clone(), engine.clone());

        let report = reconcile(&mgr).await.unwrap();
        let mut started = report.started.clone();
        started.sort();
        assert_eq!(started, vec![a, b]);
        assert!(report.failed.is_empty());

        assert!(mgr.registry().lookup(c).await.is_none());
        assert!(mgr.cache().get("a").await.is_some());
        assert!(mgr.cache().get("c").await.is_none());
        for id in [a, b] {
            let h = mgr.registry().lookup(id).await.unwrap();
            let mut rx = h.subscribe_state();
            tokio::time::timeout(
                Duration::from_secs(2),
                rx.wait_for(|s| *s == SessionState::Connected),
            )
            .await
            .unwrap()
            .unwrap();
        }
        assert_eq!(engine.opened().len(), 2);
        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn empty_instance_label_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTenantStore::new());
        let a = tenant(&store, "a", "1@s.whatsapp.net", true).await;
        let engine = FakeEngine::new();
        let mut cfg = test_config(dir.path());
        cfg.instance = "  ".to_string();
        let mgr = SessionManager::new(
            &cfg,
            engine.clone(),
            store.clone(),
            None,
            RecordingWebhook::new(),
        );

        let err = reconcile(&mgr).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(engine.opened().is_empty());
        assert!(mgr.registry().is_empty().await);
        assert!(mgr.registry().lookup(a).await.is_none());
    }

    #[tokio::test]
    async fn one_broken_tenant_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryTenantStore::new());
        let good = tenant(&store, "good", "1@s.whatsapp.net", true).await;
        let bad = tenant(&store, "bad", "broken@s.whatsapp.net", true).await;
        let engine = FakeEngine::new();
        engine.fail_identity("broken@s.whatsapp.net");
        let mgr = manager(dir.path(), store.clone(), engine.clone());

        let report = reconcile(&mgr).await.unwrap();
        assert_eq!(report.started.len(), 2);

        let h = mgr.registry().lookup(good).await.unwrap();
        let mut rx = h.subscribe_state();
        tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| *s == SessionState::Connected),
        )
        .await
        .unwrap()
        .unwrap();

        // The broken tenant's session ends on its own and is marked disconnected.
        let mut gone = false;
        for _ in 0..200 {
            if mgr.registry().lookup(bad).await.is_none() {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);
        assert!(!store.tenant_by_id(bad).await.unwrap().unwrap().connected);
        mgr.shutdown().await;
    }
}
