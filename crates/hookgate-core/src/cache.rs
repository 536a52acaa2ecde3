//! Process-local read-through cache: access token -> tenant descriptor.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::domain::CachedTenantInfo;

/// User info cache.
///
/// Entries never expire on their own. They are written at session start and
/// overwritten on pairing success. Dispatch reads webhook URL and subscriptions from
/// here; connection state is never read from the cache.
#[derive(Default)]
pub struct UserInfoCache {
    entries: RwLock<HashMap<String, CachedTenantInfo>>,
}

impl UserInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, token: &str) -> Option<CachedTenantInfo> {
        self.entries.read().await.get(token).cloned()
    }

    /// Insert or overwrite the entry keyed by `info.token`.
    pub async fn set(&self, info: CachedTenantInfo) {
        self.entries.write().await.insert(info.token.clone(), info);
    }

    /// Overwrite the device identity of an existing entry. Returns `false` when the
    /// token is not cached.
    pub async fn set_device_identity(&self, token: &str, identity: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(token) {
            Some(info) => {
                info.device_identity = identity.to_string();
                true
            }
            None => false,
        }
    }
}
