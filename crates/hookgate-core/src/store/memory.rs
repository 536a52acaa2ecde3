use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::NaiveDate;
use tokio::sync::Mutex;

use crate::{
    domain::{NewTenant, TenantId, TenantRecord, UsagePeriodRecord},
    errors::Error,
    store::port::TenantStore,
    usage::UsageCounter,
    Result,
};

#[derive(Default)]
struct MemoryState {
    next_id: i64,
    tenants: BTreeMap<TenantId, TenantRecord>,
    usage: HashMap<(TenantId, NaiveDate), UsagePeriodRecord>,
}

/// Non-durable `TenantStore`.
///
/// Used by tests and by `DB_DRIVER=memory` deployments that do not need restarts to
/// restore sessions.
#[derive(Default)]
pub struct InMemoryTenantStore {
    state: Mutex<MemoryState>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn update<F>(&self, id: TenantId, f: F) -> Result<()>
    where
        F: FnOnce(&mut TenantRecord),
    {
        let mut st = self.state.lock().await;
        let rec = st
            .tenants
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("tenant {id}")))?;
        f(rec);
        Ok(())
    }

    async fn update_scoped<F>(&self, id: TenantId, instance: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut TenantRecord),
    {
        let mut st = self.state.lock().await;
        let rec = st
            .tenants
            .get_mut(&id)
            .filter(|r| r.instance == instance)
            .ok_or_else(|| Error::NotFound(format!("tenant {id} in instance {instance}")))?;
        f(rec);
        Ok(())
    }
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn create_tenant(&self, tenant: NewTenant) -> Result<TenantId> {
        let mut st = self.state.lock().await;
        if st.tenants.values().any(|r| r.token == tenant.token) {
            return Err(Error::Store("token already in use".to_string()));
        }
        st.next_id += 1;
        let id = TenantId(st.next_id);
        st.tenants.insert(
            id,
            TenantRecord {
                id,
                name: tenant.name,
                token: tenant.token,
                webhook: tenant.webhook,
                events: tenant.events,
                instance: tenant.instance,
                expiration: tenant.expiration,
                ..TenantRecord::default()
            },
        );
        Ok(id)
    }

    async fn update_tenant(&self, tenant: &TenantRecord) -> Result<()> {
        let updated = tenant.clone();
        self.update(tenant.id, move |rec| *rec = updated).await
    }

    async fn delete_tenant(&self, id: TenantId) -> Result<()> {
        let mut st = self.state.lock().await;
        st.tenants.remove(&id);
        st.usage.retain(|(tenant, _), _| *tenant != id);
        Ok(())
    }

    async fn set_qr_code(&self, id: TenantId, qr_code: &str, instance: &str) -> Result<()> {
        self.update_scoped(id, instance, |r| r.qr_code = qr_code.to_string())
            .await
    }

    async fn set_pairing_code(&self, id: TenantId, code: &str, instance: &str) -> Result<()> {
        self.update_scoped(id, instance, |r| r.pairing_code = code.to_string())
            .await
    }

    async fn set_webhook(&self, id: TenantId, webhook: &str) -> Result<()> {
        self.update(id, |r| r.webhook = webhook.to_string()).await
    }

    async fn set_connected(&self, id: TenantId) -> Result<()> {
        self.update(id, |r| r.connected = true).await
    }

    async fn set_disconnected(&self, id: TenantId) -> Result<()> {
        self.update(id, |r| r.connected = false).await
    }

    async fn set_device_identity(&self, id: TenantId, identity: &str) -> Result<()> {
        self.update(id, |r| r.device_identity = identity.to_string())
            .await
    }

    async fn set_events(&self, id: TenantId, events: &str) -> Result<()> {
        self.update(id, |r| r.events = events.to_string()).await
    }

    async fn tenant_by_id(&self, id: TenantId) -> Result<Option<TenantRecord>> {
        Ok(self.state.lock().await.tenants.get(&id).cloned())
    }

    async fn tenant_by_token(&self, token: &str) -> Result<Option<TenantRecord>> {
        let st = self.state.lock().await;
        Ok(st.tenants.values().find(|r| r.token == token).cloned())
    }

    async fn list_connected(&self, instance: &str) -> Result<Vec<TenantRecord>> {
        let st = self.state.lock().await;
        Ok(st
            .tenants
            .values()
            .filter(|r| r.connected && r.instance == instance)
            .cloned()
            .collect())
    }

    async fn record_usage(
        &self,
        id: TenantId,
        counter: UsageCounter,
        date: NaiveDate,
    ) -> Result<()> {
        let mut st = self.state.lock().await;
        let tenant = st
            .tenants
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("tenant {id}")))?;
        counter.bump(&mut tenant.counters);

        let day = st
            .usage
            .entry((id, date))
            .or_insert_with(|| UsagePeriodRecord::empty(id, date));
        match counter {
            UsageCounter::Online => day.is_online = true,
            other => other.bump(&mut day.counters),
        }
        Ok(())
    }

    async fn usage_for(&self, id: TenantId, date: NaiveDate) -> Result<Option<UsagePeriodRecord>> {
        Ok(self.state.lock().await.usage.get(&(id, date)).cloned())
    }
}
