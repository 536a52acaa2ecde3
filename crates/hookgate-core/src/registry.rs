//! In-process map from tenant to its live session.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, OnceLock,
    },
};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::{domain::TenantId, engine::port::EngineClient, errors::Error, Result};

/// Why a session was asked to stop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationReason {
    /// Explicit stop request (API, admin).
    Stopped,
    /// The remote side logged the device out.
    LoggedOut,
    /// Nobody scanned the QR code in time.
    PairingTimeout,
    PairingFailed,
    ConnectFailed,
    /// Process shutdown. The persisted connected flag is kept so the next start restores
    /// the session.
    Shutdown,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::Stopped => "stopped",
            TerminationReason::LoggedOut => "logged_out",
            TerminationReason::PairingTimeout => "pairing_timeout",
            TerminationReason::PairingFailed => "pairing_failed",
            TerminationReason::ConnectFailed => "connect_failed",
            TerminationReason::Shutdown => "shutdown",
        }
    }

    /// Whether cleanup should clear the persisted connected flag.
    pub fn clears_connected_flag(self) -> bool {
        !matches!(self, TerminationReason::Shutdown)
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable lifecycle state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    PairingRequired,
    AwaitingHandshake,
    Connected,
    Terminating,
    Terminated,
}

struct HandleShared {
    tenant_id: TenantId,
    generation: u64,
    cancel: CancellationToken,
    reason: StdMutex<Option<TerminationReason>>,
    client: OnceLock<Arc<dyn EngineClient>>,
    state: watch::Sender<SessionState>,
}

/// Cheap clone of a registered session: its kill signal, engine client and state.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<HandleShared>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("tenant_id", &self.inner.tenant_id)
            .field("generation", &self.inner.generation)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    fn new(tenant_id: TenantId, generation: u64) -> Self {
        let (state, _) = watch::channel(SessionState::Starting);
        Self {
            inner: Arc::new(HandleShared {
                tenant_id,
                generation,
                cancel: CancellationToken::new(),
                reason: StdMutex::new(None),
                client: OnceLock::new(),
                state,
            }),
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.inner.tenant_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Deliver the kill signal. The first reason wins; later calls are no-ops.
    pub fn terminate(&self, reason: TerminationReason) {
        {
            let mut slot = self
                .inner
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.inner.cancel.cancel();
    }

    pub fn termination_reason(&self) -> Option<TerminationReason> {
        *self
            .inner
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Attach the engine client once it has been opened. Returns `false` if one was
    /// already attached.
    pub fn attach_client(&self, client: Arc<dyn EngineClient>) -> bool {
        self.inner.client.set(client).is_ok()
    }

    pub fn client(&self) -> Option<Arc<dyn EngineClient>> {
        self.inner.client.get().cloned()
    }

    /// Live protocol connection state, read from the engine client.
    pub fn is_connected(&self) -> bool {
        self.inner
            .client
            .get()
            .map(|c| c.is_connected())
            .unwrap_or(false)
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub(crate) fn set_state(&self, state: SessionState) {
        self.inner.state.send_replace(state);
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until cleanup has finished.
    pub async fn terminated(&self) {
        let mut rx = self.subscribe_state();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|s| *s == SessionState::Terminated).await;
    }
}

/// Session registry. At most one live session per tenant.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<TenantId, SessionHandle>>,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh handle for `tenant_id`.
    ///
    /// Fails with [`Error::AlreadyRunning`] when an entry exists; the caller decides
    /// what to do with an existing session.
    pub async fn register(&self, tenant_id: TenantId) -> Result<SessionHandle> {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&tenant_id) {
            return Err(Error::AlreadyRunning {
                tenant_id,
                connected: existing.is_connected(),
            });
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SessionHandle::new(tenant_id, generation);
        sessions.insert(tenant_id, handle.clone());
        Ok(handle)
    }

    pub async fn lookup(&self, tenant_id: TenantId) -> Option<SessionHandle> {
        self.sessions.lock().await.get(&tenant_id).cloned()
    }

    /// Send the kill signal to a tenant's session. Returns `false` (and does nothing)
    /// when no session is registered.
    pub async fn terminate(&self, tenant_id: TenantId, reason: TerminationReason) -> bool {
        let handle = self.lookup(tenant_id).await;
        match handle {
            Some(h) => {
                h.terminate(reason);
                true
            }
            None => false,
        }
    }

    /// Remove the entry, but only if it still belongs to `generation`. A stale cleanup
    /// must not evict a newer session for the same tenant.
    pub async fn unregister(&self, tenant_id: TenantId, generation: u64) -> bool {
        let mut sessions = self.sessions.lock().await;
        match sessions.get(&tenant_id) {
            Some(h) if h.generation() == generation => {
                sessions.remove(&tenant_id);
                true
            }
            _ => false,
        }
    }

    pub async fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.sessions.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_register_reports_already_running() {
        let reg = SessionRegistry::new();
        let first = reg.register(TenantId(7)).await.unwrap();
        assert_eq!(first.state(), SessionState::Starting);

        let err = reg.register(TenantId(7)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::AlreadyRunning {
                tenant_id: TenantId(7),
                connected: false
            }
        ));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn first_termination_reason_wins() {
        let reg = SessionRegistry::new();
        let h = reg.register(TenantId(1)).await.unwrap();

        assert!(reg.terminate(TenantId(1), TerminationReason::LoggedOut).await);
        assert!(reg.terminate(TenantId(1), TerminationReason::Stopped).await);
        assert!(h.is_cancelled());
        assert_eq!(h.termination_reason(), Some(TerminationReason::LoggedOut));

        assert!(!reg.terminate(TenantId(2), TerminationReason::Stopped).await);
    }

    #[tokio::test]
    async fn stale_generation_does_not_evict_newer_session() {
        let reg = SessionRegistry::new();
        let old = reg.register(TenantId(3)).await.unwrap();
        assert!(reg.unregister(TenantId(3), old.generation()).await);

        let new = reg.register(TenantId(3)).await.unwrap();
        assert_ne!(old.generation(), new.generation());
        assert!(!reg.unregister(TenantId(3), old.generation()).await);
        assert!(reg.lookup(TenantId(3)).await.is_some());
    }

    #[tokio::test]
    async fn terminated_resolves_after_state_change() {
        let reg = SessionRegistry::new();
        let h = reg.register(TenantId(4)).await.unwrap();
        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.terminated().await })
        };
        h.set_state(SessionState::Terminating);
        h.set_state(SessionState::Terminated);
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn shutdown_keeps_connected_flag() {
        assert!(!TerminationReason::Shutdown.clears_connected_flag());
        assert!(TerminationReason::LoggedOut.clears_connected_flag());
    }
}
