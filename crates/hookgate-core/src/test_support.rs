//! Fakes for the core ports.

use std::{
    collections::{HashSet, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    config::{Config, DbDriver, LogFormat},
    engine::{
        port::{EngineClient, ProtocolEngine},
        types::{EngineEvent, MediaAttachment, PairingEvent, Presence},
    },
    errors::Error,
    queue::QueuePublisher,
    webhook::{WebhookRequest, WebhookSender},
    Result,
};

pub(crate) fn test_config(dir: &Path) -> Config {
    Config {
        instance: "hookgate".to_string(),
        db_driver: DbDriver::Memory,
        db_path: dir.join("users.db"),
        files_dir: dir.join("files"),
        redis_uri: None,
        redis_password: None,
        queue_name: "hookgate".to_string(),
        webhook_timeout: Duration::from_secs(5),
        webhook_max_redirects: 15,
        webhook_insecure_tls: false,
        engine_bridge_path: dir.join("hookgate-engine"),
        engine_debug: None,
        log_format: LogFormat::Json,
        shutdown_grace: Duration::from_secs(2),
    }
}

/// Poll `cond` until it holds or two seconds pass.
pub(crate) async fn eventually<F: Fn() -> bool>(cond: F) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

pub(crate) struct FakeClient {
    pub identity: Option<String>,
    paired: AtomicBool,
    connected: AtomicBool,
    pub fail_connect: AtomicBool,
    /// Model an engine whose connected flag only flips on a later `Connected` event and
    /// which rejects a second connect while the first is in flight.
    pub deferred_connect: AtomicBool,
    connecting: AtomicBool,
    push_name: Mutex<Option<String>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    pairing_tx: mpsc::UnboundedSender<PairingEvent>,
    pairing_rx: Mutex<Option<mpsc::UnboundedReceiver<PairingEvent>>>,
    download: Mutex<Option<Vec<u8>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeClient {
    pub fn new(identity: Option<&str>, paired: bool) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (pairing_tx, pairing_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            identity: identity.map(str::to_string),
            paired: AtomicBool::new(paired),
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            deferred_connect: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            push_name: Mutex::new(Some("Tester".to_string())),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            pairing_tx,
            pairing_rx: Mutex::new(Some(pairing_rx)),
            download: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn pairing(&self, event: PairingEvent) {
        let _ = self.pairing_tx.send(event);
    }

    pub fn set_push_name(&self, name: Option<&str>) {
        *self.push_name.lock().unwrap() = name.map(str::to_string);
    }

    pub fn set_download(&self, bytes: &[u8]) {
        *self.download.lock().unwrap() = Some(bytes.to_vec());
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Finish a deferred connect the way the engine does: flag first, then the event.
    pub fn complete_connect(&self) {
        self.connected.store(true, Ordering::SeqCst);
        self.emit(EngineEvent::Connected);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl EngineClient for FakeClient {
    fn has_credentials(&self) -> bool {
        self.paired.load(Ordering::SeqCst)
    }

    fn push_name(&self) -> Option<String> {
        self.push_name.lock().unwrap().clone()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<EngineEvent>> {
        self.events_rx.lock().unwrap().take()
    }

    async fn pairing_events(&self) -> Result<mpsc::UnboundedReceiver<PairingEvent>> {
        self.record("pairing_events");
        self.pairing_rx
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| Error::Engine("pairing channel already taken".to_string()))
    }

    async fn connect(&self) -> Result<()> {
        self.record("connect");
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::Engine("connect refused".to_string()));
        }
        if self.deferred_connect.load(Ordering::SeqCst) {
            if self.connecting.swap(true, Ordering::SeqCst) {
                return Err(Error::Engine("already connecting".to_string()));
            }
            return Ok(());
        }
        self.connected.store(true, Ordering::SeqCst);
        let _ = self.events_tx.send(EngineEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.record("disconnect");
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn request_pairing_code(&self, phone: &str) -> Result<String> {
        self.record(format!("pair_phone:{phone}"));
        Ok("ABCD-1234".to_string())
    }

    async fn download(&self, _media: &MediaAttachment) -> Result<Vec<u8>> {
        self.record("download");
        self.download
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::Engine("media unavailable".to_string()))
    }

    async fn send_presence(&self, presence: Presence) -> Result<()> {
        self.record(format!("presence:{}", presence.as_str()));
        Ok(())
    }
}

/// Hands out scripted clients first, then fresh ones (paired iff an identity is given).
#[derive(Default)]
pub(crate) struct FakeEngine {
    scripted: Mutex<VecDeque<Arc<FakeClient>>>,
    opened: Mutex<Vec<Arc<FakeClient>>>,
    failing: Mutex<HashSet<String>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, client: Arc<FakeClient>) {
        self.scripted.lock().unwrap().push_back(client);
    }

    pub fn fail_identity(&self, identity: &str) {
        self.failing.lock().unwrap().insert(identity.to_string());
    }

    pub fn opened(&self) -> Vec<Arc<FakeClient>> {
        self.opened.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProtocolEngine for FakeEngine {
    async fn open_client(&self, identity: Option<&str>) -> Result<Arc<dyn EngineClient>> {
        if let Some(id) = identity {
            if self.failing.lock().unwrap().contains(id) {
                return Err(Error::Engine(format!("device store corrupt for {id}")));
            }
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        let client = scripted.unwrap_or_else(|| FakeClient::new(identity, identity.is_some()));
        self.opened.lock().unwrap().push(client.clone());
        Ok(client as Arc<dyn EngineClient>)
    }
}

#[derive(Default)]
pub(crate) struct RecordingWebhook {
    requests: Mutex<Vec<WebhookRequest>>,
}

impl RecordingWebhook {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<WebhookRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebhookSender for RecordingWebhook {
    async fn deliver(&self, req: WebhookRequest) -> Result<()> {
        self.requests.lock().unwrap().push(req);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingQueue {
    records: Mutex<Vec<(String, String)>>,
}

impl RecordingQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<(String, String)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueuePublisher for RecordingQueue {
    async fn publish(&self, token: &str, json_data: &str) -> Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((token.to_string(), json_data.to_string()));
        Ok(())
    }
}
