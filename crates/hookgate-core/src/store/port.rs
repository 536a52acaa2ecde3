use async_trait::async_trait;
use chrono::NaiveDate;

use crate::{
    domain::{NewTenant, TenantId, TenantRecord, UsagePeriodRecord},
    usage::UsageCounter,
    Result,
};

/// Durable tenant records and per-day usage.
///
/// Implementations provide per-statement atomicity; the core never wraps calls in its
/// own transactions.
#[async_trait]
pub trait TenantStore: Send + Sync {
    async fn create_tenant(&self, tenant: NewTenant) -> Result<TenantId>;
    async fn update_tenant(&self, tenant: &TenantRecord) -> Result<()>;
    async fn delete_tenant(&self, id: TenantId) -> Result<()>;

    /// Scoped by instance; `Error::NotFound` when no row matched.
    async fn set_qr_code(&self, id: TenantId, qr_code: &str, instance: &str) -> Result<()>;
    /// Scoped by instance; `Error::NotFound` when no row matched.
    async fn set_pairing_code(&self, id: TenantId, code: &str, instance: &str) -> Result<()>;
    async fn set_webhook(&self, id: TenantId, webhook: &str) -> Result<()>;
    async fn set_connected(&self, id: TenantId) -> Result<()>;
    async fn set_disconnected(&self, id: TenantId) -> Result<()>;
    async fn set_device_identity(&self, id: TenantId, identity: &str) -> Result<()>;
    async fn set_events(&self, id: TenantId, events: &str) -> Result<()>;

    async fn tenant_by_id(&self, id: TenantId) -> Result<Option<TenantRecord>>;
    async fn tenant_by_token(&self, token: &str) -> Result<Option<TenantRecord>>;

    /// Tenants whose connected flag is set, restricted to `instance`.
    async fn list_connected(&self, instance: &str) -> Result<Vec<TenantRecord>>;

    /// Bump a counter (or set the online flag) on the tenant's usage record for `date`,
    /// creating the record with zeroed counters first when it does not exist.
    async fn record_usage(&self, id: TenantId, counter: UsageCounter, date: NaiveDate)
        -> Result<()>;

    async fn usage_for(&self, id: TenantId, date: NaiveDate) -> Result<Option<UsagePeriodRecord>>;
}
