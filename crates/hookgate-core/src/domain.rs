use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Tenant primary key (numeric, assigned by the store).
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TenantId(pub i64);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifetime message counters kept on the tenant row.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageCounters {
    pub text: i64,
    pub image: i64,
    pub voice: i64,
    pub video: i64,
    pub sticker: i64,
    pub location: i64,
    pub contact: i64,
    pub document: i64,
}

/// Persisted tenant row.
///
/// Owned by the store; the core only changes it through the `TenantStore` setters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub name: String,
    pub token: String,
    pub webhook: String,
    /// Device identity (JID). Empty until paired.
    pub device_identity: String,
    pub qr_code: String,
    pub pairing_code: String,
    pub connected: bool,
    pub expiration: i64,
    /// Comma-joined subscription list, e.g. `Message,ReadReceipt`.
    pub events: String,
    pub instance: String,
    pub counters: MessageCounters,
}

/// Fields required to create a tenant.
#[derive(Clone, Debug, Default)]
pub struct NewTenant {
    pub name: String,
    pub token: String,
    pub webhook: String,
    pub events: String,
    pub instance: String,
    pub expiration: i64,
}

/// One row per tenant per calendar day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsagePeriodRecord {
    pub tenant_id: TenantId,
    pub date: NaiveDate,
    pub counters: MessageCounters,
    pub is_online: bool,
}

impl UsagePeriodRecord {
    pub fn empty(tenant_id: TenantId, date: NaiveDate) -> Self {
        Self {
            tenant_id,
            date,
            counters: MessageCounters::default(),
            is_online: false,
        }
    }
}

/// Denormalized tenant descriptor held by the user info cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedTenantInfo {
    pub id: TenantId,
    pub device_identity: String,
    pub webhook: String,
    pub token: String,
    pub events: String,
}

impl From<&TenantRecord> for CachedTenantInfo {
    fn from(r: &TenantRecord) -> Self {
        Self {
            id: r.id,
            device_identity: r.device_identity.clone(),
            webhook: r.webhook.clone(),
            token: r.token.clone(),
            events: r.events.clone(),
        }
    }
}
