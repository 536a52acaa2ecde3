//! Per-session event classification and fan-out.
//!
//! One dispatcher per session drains the engine event stream in order. Each event is
//! classified, its persistence side effects are applied, and the resulting envelope is
//! handed to the queue and (subject to subscriptions) the tenant webhook. Deliveries run
//! as tracked tasks so they never block the next event.

use std::{path::PathBuf, sync::Arc};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    cache::UserInfoCache,
    domain::{CachedTenantInfo, TenantId},
    engine::{
        port::EngineClient,
        types::{
            EngineEvent, MessageEvent, Presence, PresenceEvent, ReceiptEvent,
            CRITICAL_BLOCK_PATCH,
        },
    },
    events::{EventCategory, Subscriptions},
    media::{HistorySequence, TenantFiles},
    queue::QueuePublisher,
    registry::{SessionRegistry, TerminationReason},
    store::port::TenantStore,
    usage::UsageCounter,
    utils::{token_fingerprint, usage_day_utc},
    webhook::{WebhookRequest, WebhookSender},
};

/// What gets serialized into `jsonData`.
#[derive(Clone, Debug, PartialEq)]
pub struct Envelope {
    pub category: EventCategory,
    pub event: Value,
    pub state: Option<&'static str>,
    pub attachment: Option<PathBuf>,
}

impl Envelope {
    fn new(category: EventCategory, event: Value) -> Self {
        Self {
            category,
            event,
            state: None,
            attachment: None,
        }
    }

    fn with_state(mut self, state: &'static str) -> Self {
        self.state = Some(state);
        self
    }

    /// `{"event": .., "type": .., "state"?: ..}`
    pub fn json_data(&self) -> String {
        let mut body = json!({
            "event": self.event,
            "type": self.category.as_str(),
        });
        if let (Some(state), Some(obj)) = (self.state, body.as_object_mut()) {
            obj.insert("state".to_string(), Value::String(state.to_string()));
        }
        body.to_string()
    }
}

/// Everything a dispatcher needs from its session.
pub struct DispatchContext {
    pub tenant_id: TenantId,
    pub token: String,
    pub instance: String,
    pub subscriptions: Subscriptions,
    pub client: Arc<dyn EngineClient>,
    pub store: Arc<dyn TenantStore>,
    pub cache: Arc<UserInfoCache>,
    pub queue: Option<Arc<dyn QueuePublisher>>,
    pub webhook: Arc<dyn WebhookSender>,
    pub registry: Arc<SessionRegistry>,
    pub files: TenantFiles,
    pub history: HistorySequence,
    pub deliveries: TaskTracker,
}

pub struct Dispatcher {
    ctx: DispatchContext,
    token_fp: String,
}

impl Dispatcher {
    pub fn new(ctx: DispatchContext) -> Self {
        let token_fp = token_fingerprint(&ctx.token);
        Self { ctx, token_fp }
    }

    /// Process events in delivery order until the stream ends or `cancel` fires.
    pub async fn run(self, mut events: mpsc::UnboundedReceiver<EngineEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                ev = events.recv() => match ev {
                    Some(ev) => self.handle(ev).await,
                    None => break,
                },
            }
        }
        debug!(tenant_id = %self.ctx.tenant_id, "event pump stopped");
    }

    pub async fn handle(&self, event: EngineEvent) {
        if let Some(envelope) = self.apply(event).await {
            self.route(envelope).await;
        }
    }

    /// Classify and apply side effects. `None` means the event is dropped.
    pub async fn apply(&self, event: EngineEvent) -> Option<Envelope> {
        let tenant_id = self.ctx.tenant_id;
        let Some(category) = EventCategory::classify(&event) else {
            match &event {
                EngineEvent::Disconnected => {
                    info!(%tenant_id, "engine reported disconnect");
                }
                other => {
                    warn!(%tenant_id, event = other.name(), "unhandled event dropped");
                }
            }
            return None;
        };
        let payload = event.payload();

        match event {
            EngineEvent::Connected | EngineEvent::PushNameSetting => {
                info!(%tenant_id, event = category.as_str(), "connected event received");
                self.announce_available().await;
                if let Err(e) = self.ctx.store.set_connected(tenant_id).await {
                    error!(%tenant_id, error = %e, "could not mark tenant connected");
                }
                if category == EventCategory::Connected {
                    if let Err(e) = self
                        .ctx
                        .store
                        .set_qr_code(tenant_id, "", &self.ctx.instance)
                        .await
                    {
                        warn!(%tenant_id, error = %e, "could not clear qr code");
                    }
                    self.count(UsageCounter::Online).await;
                }
            }
            EngineEvent::AppStateSyncComplete(ev) => {
                if ev.name == CRITICAL_BLOCK_PATCH {
                    self.announce_available().await;
                }
            }
            EngineEvent::PairSuccess(ev) => {
                info!(%tenant_id, token = %self.token_fp, jid = %ev.id, platform = %ev.platform, "pair success");
                self.on_paired(&ev.id).await;
            }
            EngineEvent::StreamReplaced => {
                info!(%tenant_id, "stream replaced");
                return None;
            }
            EngineEvent::Message(msg) => {
                let attachment = self.on_message(&msg).await;
                return Some(Envelope {
                    attachment,
                    ..Envelope::new(category, payload)
                });
            }
            EngineEvent::Receipt(ev) => {
                let state = receipt_state(&ev)?;
                return Some(Envelope::new(category, payload).with_state(state));
            }
            EngineEvent::Presence(ev) => {
                let state = presence_state(&ev);
                info!(%tenant_id, from = %ev.from, state, "presence received");
                return Some(Envelope::new(category, payload).with_state(state));
            }
            EngineEvent::ChatPresence(ev) => {
                info!(%tenant_id, chat = %ev.chat, state = %ev.state, media = %ev.media, "chat presence received");
            }
            EngineEvent::HistorySync(ref data) => {
                let seq = self.ctx.history.next();
                match self.ctx.files.save_history(seq, data).await {
                    Ok(path) => info!(%tenant_id, path = %path.display(), "wrote history sync"),
                    Err(e) => error!(%tenant_id, error = %e, "failed to write history sync"),
                }
            }
            EngineEvent::AppState(ev) => {
                info!(%tenant_id, index = ?ev.index, "app state event received");
            }
            EngineEvent::LoggedOut(ev) => {
                info!(%tenant_id, reason = %ev.reason, "logged out");
                if let Err(e) = self.ctx.store.set_disconnected(tenant_id).await {
                    error!(%tenant_id, error = %e, "could not mark tenant disconnected");
                }
                self.ctx
                    .registry
                    .terminate(tenant_id, TerminationReason::LoggedOut)
                    .await;
            }
            EngineEvent::CallOffer(_)
            | EngineEvent::CallAccept(_)
            | EngineEvent::CallTerminate(_)
            | EngineEvent::CallOfferNotice(_)
            | EngineEvent::CallRelayLatency(_) => {
                info!(%tenant_id, event = category.as_str(), payload = %payload, "call event");
            }
            EngineEvent::Disconnected | EngineEvent::Unknown { .. } => return None,
        }
        Some(Envelope::new(category, payload))
    }

    /// Queue always; webhook only when configured and subscribed.
    pub async fn route(&self, envelope: Envelope) {
        let json_data = envelope.json_data();
        let tenant_id = self.ctx.tenant_id;

        if let Some(queue) = self.ctx.queue.clone() {
            let token = self.ctx.token.clone();
            let json_data = json_data.clone();
            self.ctx.deliveries.spawn(async move {
                if let Err(e) = queue.publish(&token, &json_data).await {
                    warn!(%tenant_id, error = %e, "queue publish failed");
                }
            });
        }

        if !envelope.category.is_subscribable() {
            return;
        }
        let url = match self.ctx.cache.get(&self.ctx.token).await {
            Some(info) => info.webhook,
            None => {
                warn!(%tenant_id, token = %self.token_fp, "no cached tenant info; webhook skipped");
                return;
            }
        };
        if url.is_empty() {
            return;
        }
        if !self.ctx.subscriptions.allows(envelope.category) {
            debug!(%tenant_id, category = envelope.category.as_str(), "not subscribed; webhook skipped");
            return;
        }

        let webhook = self.ctx.webhook.clone();
        let req = WebhookRequest {
            url,
            token: self.ctx.token.clone(),
            json_data,
            file: envelope.attachment,
        };
        info!(%tenant_id, url = %req.url, category = envelope.category.as_str(), "calling webhook");
        self.ctx.deliveries.spawn(async move {
            if let Err(e) = webhook.deliver(req).await {
                warn!(%tenant_id, error = %e, "webhook delivery failed");
            }
        });
    }

    async fn announce_available(&self) {
        if self.ctx.client.push_name().filter(|n| !n.is_empty()).is_none() {
            return;
        }
        match self.ctx.client.send_presence(Presence::Available).await {
            Ok(()) => info!(tenant_id = %self.ctx.tenant_id, "marked self as available"),
            Err(e) => warn!(tenant_id = %self.ctx.tenant_id, error = %e, "failed to send available presence"),
        }
    }

    async fn on_paired(&self, jid: &str) {
        let tenant_id = self.ctx.tenant_id;
        if let Err(e) = self.ctx.store.set_device_identity(tenant_id, jid).await {
            error!(%tenant_id, error = %e, "could not persist device identity");
            return;
        }
        if let Err(e) = self.ctx.store.set_connected(tenant_id).await {
            error!(%tenant_id, error = %e, "could not mark tenant connected");
        }
        if self.ctx.cache.set_device_identity(&self.ctx.token, jid).await {
            return;
        }
        // Not cached yet: rebuild the entry from the persisted record.
        match self.ctx.store.tenant_by_id(tenant_id).await {
            Ok(Some(rec)) => self.ctx.cache.set(CachedTenantInfo::from(&rec)).await,
            Ok(None) => warn!(%tenant_id, "tenant vanished during pairing"),
            Err(e) => error!(%tenant_id, error = %e, "could not reload tenant"),
        }
    }

    async fn on_message(&self, msg: &MessageEvent) -> Option<PathBuf> {
        let tenant_id = self.ctx.tenant_id;
        info!(
            %tenant_id,
            id = %msg.info.id,
            chat = %msg.info.chat,
            sender = %msg.info.sender,
            push_name = %msg.info.push_name,
            view_once = msg.is_view_once,
            ephemeral = msg.is_ephemeral,
            "message received"
        );
        if let Some(counter) = UsageCounter::for_message(msg.kind) {
            self.count(counter).await;
        }

        let media = msg.media.as_ref()?;
        let bytes = match self.ctx.client.download(media).await {
            Ok(b) => b,
            Err(e) => {
                error!(%tenant_id, id = %msg.info.id, error = %e, "failed to download media");
                return None;
            }
        };
        match self.ctx.files.save_attachment(&msg.info.id, media, &bytes).await {
            Ok(path) => {
                info!(%tenant_id, path = %path.display(), "media saved");
                Some(path)
            }
            Err(e) => {
                error!(%tenant_id, error = %e, "failed to save media");
                None
            }
        }
    }

    async fn count(&self, counter: UsageCounter) {
        let tenant_id = self.ctx.tenant_id;
        if let Err(e) = self
            .ctx
            .store
            .record_usage(tenant_id, counter, usage_day_utc())
            .await
        {
            warn!(%tenant_id, counter = counter.as_str(), error = %e, "usage update failed");
        }
    }
}

/// Receipt types other than read/read-self/delivered are dropped.
fn receipt_state(ev: &ReceiptEvent) -> Option<&'static str> {
    match ev.receipt_type.as_str() {
        "read" => Some("Read"),
        "read-self" => Some("ReadSelf"),
        "delivered" | "" => Some("Delivered"),
        _ => None,
    }
}

fn presence_state(ev: &PresenceEvent) -> &'static str {
    if ev.unavailable {
        "offline"
    } else {
        "online"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::NewTenant,
        engine::types::{
            LoggedOutEvent, MediaAttachment, MessageInfo, MessageKind, PairSuccessEvent,
        },
        store::memory::InMemoryTenantStore,
        test_support::{FakeClient, RecordingQueue, RecordingWebhook},
    };

    struct Harness {
        dispatcher: Dispatcher,
        store: Arc<InMemoryTenantStore>,
        cache: Arc<UserInfoCache>,
        client: Arc<FakeClient>,
        webhook: Arc<RecordingWebhook>,
        queue: Arc<RecordingQueue>,
        registry: Arc<SessionRegistry>,
        deliveries: TaskTracker,
        tenant_id: TenantId,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn new(webhook_url: &str, events: &str) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(InMemoryTenantStore::new());
            let tenant_id = store
                .create_tenant(NewTenant {
                    name: "acme".to_string(),
                    token: "tok-acme".to_string(),
                    webhook: webhook_url.to_string(),
                    events: events.to_string(),
                    instance: "hookgate".to_string(),
                    expiration: 0,
                })
                .await
                .unwrap();
            let rec = store.tenant_by_id(tenant_id).await.unwrap().unwrap();
            let cache = Arc::new(UserInfoCache::new());
            cache.set(CachedTenantInfo::from(&rec)).await;

            let client = FakeClient::new(None, false);
            let webhook = RecordingWebhook::new();
            let queue = RecordingQueue::new();
            let registry = Arc::new(SessionRegistry::new());
            let deliveries = TaskTracker::new();

            let dispatcher = Dispatcher::new(DispatchContext {
                tenant_id,
                token: rec.token.clone(),
                instance: "hookgate".to_string(),
                subscriptions: Subscriptions::parse_csv(events),
                client: client.clone(),
                store: store.clone(),
                cache: cache.clone(),
                queue: Some(queue.clone()),
                webhook: webhook.clone(),
                registry: registry.clone(),
                files: TenantFiles::new(dir.path(), tenant_id),
                history: HistorySequence::new(),
                deliveries: deliveries.clone(),
            });
            Self {
                dispatcher,
                store,
                cache,
                client,
                webhook,
                queue,
                registry,
                deliveries,
                tenant_id,
                _dir: dir,
            }
        }

        async fn handle(&self, event: EngineEvent) {
            self.dispatcher.handle(event).await;
            self.deliveries.close();
            self.deliveries.wait().await;
            self.deliveries.reopen();
        }
    }

    fn image_message(id: &str) -> EngineEvent {
        EngineEvent::Message(Box::new(MessageEvent {
            info: MessageInfo {
                id: id.to_string(),
                chat: "5511@s.whatsapp.net".to_string(),
                ..MessageInfo::default()
            },
            kind: MessageKind::Image,
            media: Some(MediaAttachment {
                kind: MessageKind::Image,
                mime_type: "image/jpeg".to_string(),
                file_name: None,
                handle: json!({"direct_path": "/v/1"}),
            }),
            ..MessageEvent::default()
        }))
    }

    fn presence() -> EngineEvent {
        EngineEvent::Presence(PresenceEvent {
            from: "5511@s.whatsapp.net".to_string(),
            unavailable: true,
            last_seen: None,
        })
    }

    #[tokio::test]
    async fn presence_without_webhook_is_queued_but_not_delivered() {
        let h = Harness::new("", "Message").await;
        h.handle(presence()).await;

        assert!(h.webhook.requests().is_empty());
        let records = h.queue.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].0, "tok-acme");
        let v: Value = serde_json::from_str(&records[0].1).unwrap();
        assert_eq!(v["type"], "Presence");
        assert_eq!(v["state"], "offline");
    }

    #[tokio::test]
    async fn image_message_sends_one_file_delivery() {
        let h = Harness::new("http://hook.local/in", "All").await;
        h.client.set_download(b"\xff\xd8jpeg");
        h.handle(image_message("3EB0ABC")).await;

        let reqs = h.webhook.requests();
        assert_eq!(reqs.len(), 1);
        let req = &reqs[0];
        assert_eq!(req.token, "tok-acme");
        assert_eq!(req.url, "http://hook.local/in");
        let path = req.file.as_ref().expect("file variant");
        assert!(path.ends_with(format!("user_{}/3EB0ABC.jpg", h.tenant_id.0)));
        assert_eq!(std::fs::read(path).unwrap(), b"\xff\xd8jpeg");

        let v: Value = serde_json::from_str(&req.json_data).unwrap();
        assert_eq!(v["type"], "Message");
        assert_eq!(v["event"]["info"]["id"], "3EB0ABC");

        let day = h
            .store
            .usage_for(h.tenant_id, usage_day_utc())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(day.counters.image, 1);
    }

    #[tokio::test]
    async fn failed_download_still_delivers_plain_event() {
        let h = Harness::new("http://hook.local/in", "Message").await;
        h.handle(image_message("NODATA")).await;

        let reqs = h.webhook.requests();
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].file.is_none());
    }

    #[tokio::test]
    async fn unsubscribed_category_skips_webhook_but_not_queue() {
        let h = Harness::new("http://hook.local/in", "Message").await;
        h.handle(EngineEvent::Receipt(ReceiptEvent {
            message_ids: vec!["A".to_string()],
            receipt_type: "read".to_string(),
            ..ReceiptEvent::default()
        }))
        .await;

        assert!(h.webhook.requests().is_empty());
        let records = h.queue.records();
        assert_eq!(records.len(), 1);
        let v: Value = serde_json::from_str(&records[0].1).unwrap();
        assert_eq!(v["type"], "ReadReceipt");
        assert_eq!(v["state"], "Read");
    }

    #[tokio::test]
    async fn other_receipt_types_are_dropped() {
        let h = Harness::new("http://hook.local/in", "All").await;
        h.handle(EngineEvent::Receipt(ReceiptEvent {
            receipt_type: "played".to_string(),
            ..ReceiptEvent::default()
        }))
        .await;
        assert!(h.queue.records().is_empty());
        assert!(h.webhook.requests().is_empty());
    }

    #[tokio::test]
    async fn connected_marks_tenant_online() {
        let h = Harness::new("http://hook.local/in", "All").await;
        h.store
            .set_qr_code(h.tenant_id, "data:stale", "hookgate")
            .await
            .unwrap();
        h.handle(EngineEvent::Connected).await;

        let rec = h.store.tenant_by_id(h.tenant_id).await.unwrap().unwrap();
        assert!(rec.connected);
        assert_eq!(rec.qr_code, "");
        assert_eq!(h.client.count("presence:available"), 1);
        let day = h
            .store
            .usage_for(h.tenant_id, usage_day_utc())
            .await
            .unwrap()
            .unwrap();
        assert!(day.is_online);
        // Connection events go to the queue only.
        assert!(h.webhook.requests().is_empty());
        assert_eq!(h.queue.records().len(), 1);
    }

    #[tokio::test]
    async fn connected_without_push_name_skips_presence() {
        let h = Harness::new("", "All").await;
        h.client.set_push_name(None);
        h.handle(EngineEvent::PushNameSetting).await;
        assert_eq!(h.client.count("presence:available"), 0);
        assert!(h.store.tenant_by_id(h.tenant_id).await.unwrap().unwrap().connected);
    }

    #[tokio::test]
    async fn pair_success_persists_identity_and_updates_cache() {
        let h = Harness::new("", "All").await;
        h.handle(EngineEvent::PairSuccess(PairSuccessEvent {
            id: "5511@s.whatsapp.net".to_string(),
            ..PairSuccessEvent::default()
        }))
        .await;

        let rec = h.store.tenant_by_id(h.tenant_id).await.unwrap().unwrap();
        assert_eq!(rec.device_identity, "5511@s.whatsapp.net");
        assert!(rec.connected);
        let cached = h.cache.get("tok-acme").await.unwrap();
        assert_eq!(cached.device_identity, "5511@s.whatsapp.net");
    }

    #[tokio::test]
    async fn logged_out_disconnects_and_terminates() {
        let h = Harness::new("", "All").await;
        h.store.set_connected(h.tenant_id).await.unwrap();
        let handle = h.registry.register(h.tenant_id).await.unwrap();

        h.handle(EngineEvent::LoggedOut(LoggedOutEvent::default())).await;

        assert!(!h.store.tenant_by_id(h.tenant_id).await.unwrap().unwrap().connected);
        assert!(handle.is_cancelled());
        assert_eq!(handle.termination_reason(), Some(TerminationReason::LoggedOut));
    }

    #[tokio::test]
    async fn history_sync_is_written_and_delivered() {
        let h = Harness::new("http://hook.local/in", "HistorySync").await;
        h.handle(EngineEvent::HistorySync(json!({"conversations": []}))).await;

        let dir = h.dispatcher.ctx.files.root().to_path_buf();
        let dumps: Vec<_> = std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("history-"))
            .collect();
        assert_eq!(dumps.len(), 1);
        assert_eq!(h.webhook.requests().len(), 1);
    }

    #[tokio::test]
    async fn unknown_and_stream_replaced_are_dropped() {
        let h = Harness::new("http://hook.local/in", "All").await;
        h.handle(EngineEvent::Unknown {
            kind: "Blocklist".to_string(),
            raw: json!({}),
        })
        .await;
        h.handle(EngineEvent::StreamReplaced).await;
        h.handle(EngineEvent::Disconnected).await;
        assert!(h.queue.records().is_empty());
        assert!(h.webhook.requests().is_empty());
    }

    #[tokio::test]
    async fn run_processes_in_order_and_stops_on_cancel() {
        let h = Harness::new("http://hook.local/in", "All").await;
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        for i in 0..3 {
            tx.send(EngineEvent::ChatPresence(crate::engine::types::ChatPresenceEvent {
                chat: format!("chat-{i}"),
                ..Default::default()
            }))
            .unwrap();
        }
        let Harness {
            dispatcher,
            webhook,
            deliveries,
            ..
        } = h;
        let pump = tokio::spawn(dispatcher.run(rx, cancel.clone()));
        assert!(
            crate::test_support::eventually(|| webhook.requests().len() == 3).await
        );
        cancel.cancel();
        pump.await.unwrap();
        deliveries.close();
        deliveries.wait().await;

        let chats: Vec<String> = webhook
            .requests()
            .iter()
            .map(|r| {
                let v: Value = serde_json::from_str(&r.json_data).unwrap();
                v["event"]["chat"].as_str().unwrap().to_string()
            })
            .collect();
        // Deliveries are concurrent; only the set is guaranteed.
        let mut sorted = chats.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["chat-0", "chat-1", "chat-2"]);
    }
}
