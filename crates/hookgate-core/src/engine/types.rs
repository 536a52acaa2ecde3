use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Content kind of an inbound message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Video,
    Sticker,
    Location,
    Contact,
    Document,
    #[default]
    Other,
}

impl From<String> for MessageKind {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "text" => MessageKind::Text,
            "image" => MessageKind::Image,
            "audio" => MessageKind::Audio,
            "video" => MessageKind::Video,
            "sticker" => MessageKind::Sticker,
            "location" => MessageKind::Location,
            "contact" => MessageKind::Contact,
            "document" => MessageKind::Document,
            _ => MessageKind::Other,
        }
    }
}

/// Downloadable media referenced by a message.
///
/// `handle` is engine-specific (keys, direct path...) and passed back verbatim on download.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MessageKind,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub handle: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    pub id: String,
    #[serde(default)]
    pub chat: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub push_name: String,
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub is_from_me: bool,
    #[serde(default)]
    pub is_group: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageEvent {
    pub info: MessageInfo,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub media: Option<MediaAttachment>,
    #[serde(default)]
    pub is_view_once: bool,
    #[serde(default)]
    pub is_ephemeral: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    #[serde(default)]
    pub message_ids: Vec<String>,
    #[serde(default)]
    pub chat: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub timestamp: i64,
    /// Engine receipt type: `read`, `read-self`, `delivered`, ...
    #[serde(default, rename = "type")]
    pub receipt_type: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub from: String,
    #[serde(default)]
    pub unavailable: bool,
    #[serde(default)]
    pub last_seen: Option<i64>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatPresenceEvent {
    #[serde(default)]
    pub chat: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub media: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PairSuccessEvent {
    pub id: String,
    #[serde(default)]
    pub business_name: String,
    #[serde(default)]
    pub platform: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStateEvent {
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub action: Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AppStateSyncCompleteEvent {
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LoggedOutEvent {
    #[serde(default)]
    pub on_connect: bool,
    #[serde(default)]
    pub reason: String,
}

/// App-state patch after which the device announces itself as available.
pub const CRITICAL_BLOCK_PATCH: &str = "critical_block";

/// Typed events pushed by an engine client.
///
/// Each variant carries its own payload; anything the engine emits that does not map
/// onto a known shape becomes [`EngineEvent::Unknown`].
#[derive(Clone, Debug, PartialEq)]
pub enum EngineEvent {
    Connected,
    Disconnected,
    PushNameSetting,
    StreamReplaced,
    AppStateSyncComplete(AppStateSyncCompleteEvent),
    PairSuccess(PairSuccessEvent),
    Message(Box<MessageEvent>),
    Receipt(ReceiptEvent),
    Presence(PresenceEvent),
    ChatPresence(ChatPresenceEvent),
    HistorySync(Value),
    AppState(AppStateEvent),
    LoggedOut(LoggedOutEvent),
    CallOffer(Value),
    CallAccept(Value),
    CallTerminate(Value),
    CallOfferNotice(Value),
    CallRelayLatency(Value),
    Unknown { kind: String, raw: Value },
}

impl EngineEvent {
    pub fn name(&self) -> &str {
        match self {
            EngineEvent::Connected => "Connected",
            EngineEvent::Disconnected => "Disconnected",
            EngineEvent::PushNameSetting => "PushNameSetting",
            EngineEvent::StreamReplaced => "StreamReplaced",
            EngineEvent::AppStateSyncComplete(_) => "AppStateSyncComplete",
            EngineEvent::PairSuccess(_) => "PairSuccess",
            EngineEvent::Message(_) => "Message",
            EngineEvent::Receipt(_) => "Receipt",
            EngineEvent::Presence(_) => "Presence",
            EngineEvent::ChatPresence(_) => "ChatPresence",
            EngineEvent::HistorySync(_) => "HistorySync",
            EngineEvent::AppState(_) => "AppState",
            EngineEvent::LoggedOut(_) => "LoggedOut",
            EngineEvent::CallOffer(_) => "CallOffer",
            EngineEvent::CallAccept(_) => "CallAccept",
            EngineEvent::CallTerminate(_) => "CallTerminate",
            EngineEvent::CallOfferNotice(_) => "CallOfferNotice",
            EngineEvent::CallRelayLatency(_) => "CallRelayLatency",
            EngineEvent::Unknown { kind, .. } => kind.as_str(),
        }
    }

    /// Decode an engine event from its type name and JSON payload.
    ///
    /// Unknown names and payloads that do not fit the typed shape decode to
    /// [`EngineEvent::Unknown`] so the caller can log and drop them.
    pub fn decode(kind: &str, payload: Value) -> EngineEvent {
        fn typed<T: serde::de::DeserializeOwned>(
            kind: &str,
            payload: Value,
            wrap: impl FnOnce(T) -> EngineEvent,
        ) -> EngineEvent {
            match serde_json::from_value::<T>(payload.clone()) {
                Ok(v) => wrap(v),
                Err(_) => EngineEvent::Unknown {
                    kind: kind.to_string(),
                    raw: payload,
                },
            }
        }

        match kind {
            "Connected" => EngineEvent::Connected,
            "Disconnected" => EngineEvent::Disconnected,
            "PushNameSetting" => EngineEvent::PushNameSetting,
            "StreamReplaced" => EngineEvent::StreamReplaced,
            "AppStateSyncComplete" => typed(kind, payload, EngineEvent::AppStateSyncComplete),
            "PairSuccess" => typed(kind, payload, EngineEvent::PairSuccess),
            "Message" => typed(kind, payload, |m: MessageEvent| {
                EngineEvent::Message(Box::new(m))
            }),
            "Receipt" => typed(kind, payload, EngineEvent::Receipt),
            "Presence" => typed(kind, payload, EngineEvent::Presence),
            "ChatPresence" => typed(kind, payload, EngineEvent::ChatPresence),
            "HistorySync" => EngineEvent::HistorySync(payload),
            "AppState" => typed(kind, payload, EngineEvent::AppState),
            "LoggedOut" => typed(kind, payload, EngineEvent::LoggedOut),
            "CallOffer" => EngineEvent::CallOffer(payload),
            "CallAccept" => EngineEvent::CallAccept(payload),
            "CallTerminate" => EngineEvent::CallTerminate(payload),
            "CallOfferNotice" => EngineEvent::CallOfferNotice(payload),
            "CallRelayLatency" => EngineEvent::CallRelayLatency(payload),
            other => EngineEvent::Unknown {
                kind: other.to_string(),
                raw: payload,
            },
        }
    }

    /// JSON payload placed under `event` in delivery envelopes.
    pub fn payload(&self) -> Value {
        let res = match self {
            EngineEvent::Connected
            | EngineEvent::Disconnected
            | EngineEvent::PushNameSetting
            | EngineEvent::StreamReplaced => Ok(Value::Object(Default::default())),
            EngineEvent::AppStateSyncComplete(e) => serde_json::to_value(e),
            EngineEvent::PairSuccess(e) => serde_json::to_value(e),
            EngineEvent::Message(e) => serde_json::to_value(e),
            EngineEvent::Receipt(e) => serde_json::to_value(e),
            EngineEvent::Presence(e) => serde_json::to_value(e),
            EngineEvent::ChatPresence(e) => serde_json::to_value(e),
            EngineEvent::AppState(e) => serde_json::to_value(e),
            EngineEvent::LoggedOut(e) => serde_json::to_value(e),
            EngineEvent::HistorySync(v)
            | EngineEvent::CallOffer(v)
            | EngineEvent::CallAccept(v)
            | EngineEvent::CallTerminate(v)
            | EngineEvent::CallOfferNotice(v)
            | EngineEvent::CallRelayLatency(v)
            | EngineEvent::Unknown { raw: v, .. } => Ok(v.clone()),
        };
        res.unwrap_or(Value::Null)
    }
}

/// Events on the pairing channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PairingEvent {
    /// A new code to render; valid for `timeout`.
    Code { code: String, timeout: Duration },
    Success,
    Timeout,
    Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Available,
    Unavailable,
}

impl Presence {
    pub fn as_str(self) -> &'static str {
        match self {
            Presence::Available => "available",
            Presence::Unavailable => "unavailable",
        }
    }
}
