//! QR / phone-code pairing for a device without credentials.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    domain::TenantId,
    engine::{port::EngineClient, types::PairingEvent},
    qr::{qr_data_url, terminal_qr},
    store::port::TenantStore,
};

/// First result of a start request, released to the caller exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingOutcome {
    /// Credentials were already present; no pairing needed.
    AlreadyPaired,
    /// A QR code was persisted. `pairing_code` is set when phone pairing was requested.
    CodeIssued { pairing_code: Option<String> },
    Success,
    Timeout,
    Failed(String),
}

/// One-shot completion signal for a pairing attempt.
#[derive(Debug, Default)]
pub struct PairingCompletion(Option<oneshot::Sender<PairingOutcome>>);

impl PairingCompletion {
    pub fn channel() -> (Self, oneshot::Receiver<PairingOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Release the signal. Only the first call has an effect.
    pub fn release(&mut self, outcome: PairingOutcome) -> bool {
        match self.0.take() {
            // The waiter may have gone away; that is fine.
            Some(tx) => {
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn is_released(&self) -> bool {
        self.0.is_none()
    }
}

/// How a pairing run ended. `Paired` implies the connection was already requested.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingResult {
    Paired,
    Timeout,
    ConnectFailed(String),
    Failed(String),
    Cancelled,
}

pub struct PairingMachine {
    pub tenant_id: TenantId,
    pub instance: String,
    pub client: Arc<dyn EngineClient>,
    pub store: Arc<dyn TenantStore>,
    /// Phone number for code pairing; attempted once per run.
    pub phone: Option<String>,
    /// Also print each QR code to the console log.
    pub render_terminal: bool,
}

impl PairingMachine {
    pub async fn run(
        mut self,
        completion: &mut PairingCompletion,
        cancel: &CancellationToken,
    ) -> PairingResult {
        let tenant_id = self.tenant_id;

        // The channel has to exist before connecting or early codes are lost.
        let mut events = match self.client.pairing_events().await {
            Ok(rx) => rx,
            Err(e) => {
                error!(%tenant_id, error = %e, "could not open pairing channel");
                completion.release(PairingOutcome::Failed(e.to_string()));
                return PairingResult::Failed(e.to_string());
            }
        };
        // A restart on a live session reuses its connection.
        if !self.client.is_connected() {
            if let Err(e) = self.client.connect().await {
                error!(%tenant_id, error = %e, "connect failed during pairing");
                completion.release(PairingOutcome::Failed(e.to_string()));
                return PairingResult::ConnectFailed(e.to_string());
            }
        }

        let mut codes_issued = 0usize;
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return PairingResult::Cancelled,
                ev = events.recv() => ev,
            };
            match event {
                Some(PairingEvent::Code { code, timeout }) => {
                    codes_issued += 1;
                    info!(%tenant_id, codes_issued, timeout_secs = timeout.as_secs(), "qr code issued");
                    self.persist_code(&code).await;
                    let pairing_code = self.request_phone_code().await;
                    completion.release(PairingOutcome::CodeIssued { pairing_code });
                }
                Some(PairingEvent::Timeout) => {
                    info!(%tenant_id, "qr timeout, killing session");
                    self.clear_code().await;
                    completion.release(PairingOutcome::Timeout);
                    return PairingResult::Timeout;
                }
                Some(PairingEvent::Success) => {
                    info!(%tenant_id, "qr pairing ok");
                    self.clear_code().await;
                    completion.release(PairingOutcome::Success);
                    return PairingResult::Paired;
                }
                Some(PairingEvent::Error(msg)) => {
                    warn!(%tenant_id, error = %msg, "pairing error");
                    completion.release(PairingOutcome::Failed(msg.clone()));
                    return PairingResult::Failed(msg);
                }
                None => {
                    let msg = "pairing channel closed".to_string();
                    completion.release(PairingOutcome::Failed(msg.clone()));
                    return PairingResult::Failed(msg);
                }
            }
        }
    }

    async fn persist_code(&self, code: &str) {
        let tenant_id = self.tenant_id;
        let image = match qr_data_url(code) {
            Ok(url) => url,
            Err(e) => {
                error!(%tenant_id, error = %e, "could not render qr code");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set_qr_code(tenant_id, &image, &self.instance)
            .await
        {
            error!(%tenant_id, error = %e, "could not persist qr code");
        }
        if self.render_terminal {
            match terminal_qr(code) {
                Ok(art) => info!(%tenant_id, "scan to pair:\n{art}"),
                Err(e) => warn!(%tenant_id, error = %e, "terminal qr failed"),
            }
        }
    }

    async fn request_phone_code(&mut self) -> Option<String> {
        let phone = self.phone.take()?;
        let tenant_id = self.tenant_id;
        let code = match self.client.request_pairing_code(&phone).await {
            Ok(code) => code,
            Err(e) => {
                error!(%tenant_id, error = %e, "phone pairing request failed");
                return None;
            }
        };
        if let Err(e) = self
            .store
            .set_pairing_code(tenant_id, &code, &self.instance)
            .await
        {
            error!(%tenant_id, error = %e, "could not persist pairing code");
        }
        info!(%tenant_id, "pairing code issued");
        Some(code)
    }

    async fn clear_code(&self) {
        if let Err(e) = self
            .store
            .set_qr_code(self.tenant_id, "", &self.instance)
            .await
        {
            error!(tenant_id = %self.tenant_id, error = %e, "could not clear qr code");
        }
    }
}
