//! Session lifecycle: one supervised task per tenant.
//!
//! `Starting -> PairingRequired -> AwaitingHandshake -> Connected -> Terminating -> Terminated`
//!
//! The supervisor runs the session body in its own task and always performs cleanup
//! afterwards, including when the body panics.

use std::{path::PathBuf, sync::Arc, time::Duration};

use tokio::{sync::oneshot, task::JoinHandle};
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::{
    cache::UserInfoCache,
    config::{Config, LogFormat},
    domain::{CachedTenantInfo, TenantId},
    engine::port::ProtocolEngine,
    dispatch::{DispatchContext, Dispatcher},
    errors::Error,
    events::Subscriptions,
    media::{HistorySequence, TenantFiles},
    pairing::{PairingCompletion, PairingMachine, PairingOutcome, PairingResult},
    queue::QueuePublisher,
    registry::{SessionHandle, SessionRegistry, SessionState, TerminationReason},
    store::port::TenantStore,
    utils::token_fingerprint,
    webhook::WebhookSender,
    Result,
};

/// Request to bring a tenant online.
#[derive(Clone, Debug)]
pub struct StartRequest {
    pub tenant: CachedTenantInfo,
    pub subscriptions: Subscriptions,
    /// Phone number for code pairing, if the caller asked for it.
    pub phone: Option<String>,
    /// Re-run pairing on an already connected session, reusing its client.
    pub restart_pairing: bool,
}

impl StartRequest {
    /// Subscriptions are derived from the tenant's persisted event list.
    pub fn new(tenant: CachedTenantInfo) -> Self {
        let subscriptions = Subscriptions::parse_csv(&tenant.events);
        Self {
            tenant,
            subscriptions,
            phone: None,
            restart_pairing: false,
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_pairing_restart(mut self) -> Self {
        self.restart_pairing = true;
        self
    }
}

#[derive(Debug)]
pub enum StartOutcome {
    /// A new session task was started.
    Started {
        handle: SessionHandle,
        pairing: oneshot::Receiver<PairingOutcome>,
    },
    /// Pairing was re-run on the existing session's client.
    PairingRestarted {
        pairing: oneshot::Receiver<PairingOutcome>,
    },
    /// A connected session already exists; nothing was done.
    AlreadyConnected,
    /// A session exists but has not connected yet.
    InProgress,
}

struct Inner {
    instance: String,
    files_dir: PathBuf,
    render_terminal_qr: bool,
    shutdown_grace: Duration,
    engine: Arc<dyn ProtocolEngine>,
    store: Arc<dyn TenantStore>,
    queue: Option<Arc<dyn QueuePublisher>>,
    webhook: Arc<dyn WebhookSender>,
    registry: Arc<SessionRegistry>,
    cache: Arc<UserInfoCache>,
    history: HistorySequence,
    sessions: TaskTracker,
    deliveries: TaskTracker,
}

/// What the session body hands to cleanup.
struct DriveExit {
    reason: TerminationReason,
    pump: Option<JoinHandle<()>>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        cfg: &Config,
        engine: Arc<dyn ProtocolEngine>,
        store: Arc<dyn TenantStore>,
        queue: Option<Arc<dyn QueuePublisher>>,
        webhook: Arc<dyn WebhookSender>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                instance: cfg.instance.clone(),
                files_dir: cfg.files_dir.clone(),
                render_terminal_qr: cfg.log_format == LogFormat::Console,
                shutdown_grace: cfg.shutdown_grace,
                engine,
                store,
                queue,
                webhook,
                registry: Arc::new(SessionRegistry::new()),
                cache: Arc::new(UserInfoCache::new()),
                history: HistorySequence::new(),
                sessions: TaskTracker::new(),
                deliveries: TaskTracker::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    pub fn cache(&self) -> &Arc<UserInfoCache> {
        &self.inner.cache
    }

    pub fn store(&self) -> &Arc<dyn TenantStore> {
        &self.inner.store
    }

    pub fn instance(&self) -> &str {
        &self.inner.instance
    }

    /// Start a session for a tenant, or report why none was started.
    pub async fn start(&self, req: StartRequest) -> Result<StartOutcome> {
        let tenant_id = req.tenant.id;
        match self.inner.registry.register(tenant_id).await {
            Ok(handle) => {
                self.inner.cache.set(req.tenant.clone()).await;
                let (completion, pairing) = PairingCompletion::channel();
                info!(
                    %tenant_id,
                    token = %token_fingerprint(&req.tenant.token),
                    subscriptions = %req.subscriptions.to_csv(),
                    "starting session"
                );
                let mgr = self.clone();
                let h = handle.clone();
                self.inner
                    .sessions
                    .spawn(async move { mgr.supervise(h, req, completion).await });
                Ok(StartOutcome::Started { handle, pairing })
            }
            Err(Error::AlreadyRunning {
                connected: true, ..
            }) if req.restart_pairing => self.restart_pairing(req).await,
            Err(Error::AlreadyRunning {
                connected: true, ..
            }) => {
                info!(%tenant_id, "session already connected");
                Ok(StartOutcome::AlreadyConnected)
            }
            Err(Error::AlreadyRunning {
                connected: false, ..
            }) => Ok(StartOutcome::InProgress),
            Err(e) => Err(e),
        }
    }

    /// Send the kill signal to a tenant's session. `false` if none is running.
    pub async fn stop(&self, tenant_id: TenantId) -> bool {
        self.inner
            .registry
            .terminate(tenant_id, TerminationReason::Stopped)
            .await
    }

    /// Terminate every session and wait for them (and in-flight deliveries) up to the
    /// configured grace period.
    pub async fn shutdown(&self) {
        let handles = self.inner.registry.handles().await;
        info!(sessions = handles.len(), "shutting down sessions");
        for h in &handles {
            h.terminate(TerminationReason::Shutdown);
        }

        let sessions = self.inner.sessions.clone();
        let deliveries = self.inner.deliveries.clone();
        sessions.close();
        let drain = async move {
            sessions.wait().await;
            deliveries.close();
            deliveries.wait().await;
        };
        if tokio::time::timeout(self.inner.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!(
                grace_ms = self.inner.shutdown_grace.as_millis() as u64,
                "shutdown grace elapsed with work still running"
            );
        }
    }

    async fn restart_pairing(&self, req: StartRequest) -> Result<StartOutcome> {
        let tenant_id = req.tenant.id;
        let Some(handle) = self.inner.registry.lookup(tenant_id).await else {
            return Ok(StartOutcome::InProgress);
        };
        let Some(client) = handle.client() else {
            return Ok(StartOutcome::InProgress);
        };
        info!(%tenant_id, "restarting pairing on existing client");

        let (mut completion, pairing) = PairingCompletion::channel();
        let machine = PairingMachine {
            tenant_id,
            instance: self.inner.instance.clone(),
            client,
            store: self.inner.store.clone(),
            phone: req.phone,
            render_terminal: self.inner.render_terminal_qr,
        };
        let cancel = handle.cancel_token();
        self.inner.sessions.spawn(async move {
            match machine.run(&mut completion, &cancel).await {
                PairingResult::Paired | PairingResult::Cancelled => {}
                PairingResult::Timeout => handle.terminate(TerminationReason::PairingTimeout),
                PairingResult::ConnectFailed(_) => {
                    handle.terminate(TerminationReason::ConnectFailed)
                }
                PairingResult::Failed(_) => handle.terminate(TerminationReason::PairingFailed),
            }
        });
        Ok(StartOutcome::PairingRestarted { pairing })
    }

    async fn supervise(self, handle: SessionHandle, req: StartRequest, completion: PairingCompletion) {
        let tenant_id = handle.tenant_id();
        let body = tokio::spawn(self.clone().drive(handle.clone(), req, completion));
        let exit = match body.await {
            Ok(exit) => exit,
            Err(e) => {
                error!(%tenant_id, error = %e, "session task aborted");
                DriveExit {
                    reason: TerminationReason::Stopped,
                    pump: None,
                }
            }
        };
        self.cleanup(&handle, exit).await;
    }

    async fn drive(
        self,
        handle: SessionHandle,
        req: StartRequest,
        mut completion: PairingCompletion,
    ) -> DriveExit {
        let tenant_id = handle.tenant_id();
        let cancel = handle.cancel_token();
        let identity = Some(req.tenant.device_identity.as_str()).filter(|s| !s.is_empty());

        let opened = tokio::select! {
            _ = cancel.cancelled() => return finish(&handle, None, TerminationReason::Stopped),
            res = self.inner.engine.open_client(identity) => res,
        };
        let client = match opened {
            Ok(c) => c,
            Err(e) => {
                error!(%tenant_id, error = %e, "could not open engine client");
                completion.release(PairingOutcome::Failed(e.to_string()));
                return finish(&handle, None, TerminationReason::ConnectFailed);
            }
        };
        handle.attach_client(client.clone());

        let pump = client.take_events().map(|events| {
            let dispatcher = Dispatcher::new(DispatchContext {
                tenant_id,
                token: req.tenant.token.clone(),
                instance: self.inner.instance.clone(),
                subscriptions: req.subscriptions.clone(),
                client: client.clone(),
                store: self.inner.store.clone(),
                cache: self.inner.cache.clone(),
                queue: self.inner.queue.clone(),
                webhook: self.inner.webhook.clone(),
                registry: self.inner.registry.clone(),
                files: TenantFiles::new(&self.inner.files_dir, tenant_id),
                history: self.inner.history.clone(),
                deliveries: self.inner.deliveries.clone(),
            });
            tokio::spawn(dispatcher.run(events, cancel.clone()))
        });

        if client.has_credentials() {
            completion.release(PairingOutcome::AlreadyPaired);
            handle.set_state(SessionState::AwaitingHandshake);
            if !client.is_connected() {
                let res = tokio::select! {
                    _ = cancel.cancelled() => return finish(&handle, pump, TerminationReason::Stopped),
                    res = client.connect() => res,
                };
                if let Err(e) = res {
                    error!(%tenant_id, error = %e, "connect failed");
                    return finish(&handle, pump, TerminationReason::ConnectFailed);
                }
            }
        } else {
            handle.set_state(SessionState::PairingRequired);
            let machine = PairingMachine {
                tenant_id,
                instance: self.inner.instance.clone(),
                client: client.clone(),
                store: self.inner.store.clone(),
                phone: req.phone.clone(),
                render_terminal: self.inner.render_terminal_qr,
            };
            let failed = match machine.run(&mut completion, &cancel).await {
                PairingResult::Paired => None,
                PairingResult::Timeout => Some(TerminationReason::PairingTimeout),
                PairingResult::ConnectFailed(_) => Some(TerminationReason::ConnectFailed),
                PairingResult::Failed(_) => Some(TerminationReason::PairingFailed),
                PairingResult::Cancelled => Some(TerminationReason::Stopped),
            };
            if let Some(reason) = failed {
                return finish(&handle, pump, reason);
            }
            // Pairing already issued the connect; the handshake completes on its own.
            handle.set_state(SessionState::AwaitingHandshake);
        }

        handle.set_state(SessionState::Connected);
        info!(%tenant_id, "session connected");
        cancel.cancelled().await;
        finish(&handle, pump, TerminationReason::Stopped)
    }

    async fn cleanup(&self, handle: &SessionHandle, exit: DriveExit) {
        let tenant_id = handle.tenant_id();
        handle.set_state(SessionState::Terminating);
        handle.terminate(exit.reason);
        let reason = handle.termination_reason().unwrap_or(exit.reason);

        if let Some(pump) = exit.pump {
            if let Err(e) = pump.await {
                warn!(%tenant_id, error = %e, "event pump ended abnormally");
            }
        }
        if let Some(client) = handle.client() {
            client.disconnect().await;
        }
        if reason.clears_connected_flag() {
            if let Err(e) = self.inner.store.set_disconnected(tenant_id).await {
                error!(%tenant_id, error = %e, "could not mark tenant disconnected");
            }
        }
        self.inner
            .registry
            .unregister(tenant_id, handle.generation())
            .await;
        handle.set_state(SessionState::Terminated);
        info!(%tenant_id, %reason, "session terminated");
    }
}

/// Record `reason` (unless an earlier one is set) and hand back the exit for cleanup.
fn finish(
    handle: &SessionHandle,
    pump: Option<JoinHandle<()>>,
    reason: TerminationReason,
) -> DriveExit {
    handle.terminate(reason);
    DriveExit {
        reason: handle.termination_reason().unwrap_or(reason),
        pump,
    }
}
