//! Event categories and webhook subscriptions.

use std::{collections::BTreeSet, fmt, str::FromStr};

use serde::{Serialize, Serializer};
use tracing::warn;

use crate::engine::types::EngineEvent;

/// Canonical category of a raw engine event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventCategory {
    Message,
    ReadReceipt,
    Presence,
    ChatPresence,
    HistorySync,
    AppState,
    AppStateSyncComplete,
    Connected,
    PushNameSetting,
    PairSuccess,
    StreamReplaced,
    LoggedOut,
    CallOffer,
    CallAccept,
    CallTerminate,
    CallOfferNotice,
    CallRelayLatency,
}

impl EventCategory {
    /// Classify a raw event. `None` for shapes outside the closed set.
    pub fn classify(event: &EngineEvent) -> Option<Self> {
        let c = match event {
            EngineEvent::Message(_) => EventCategory::Message,
            EngineEvent::Receipt(_) => EventCategory::ReadReceipt,
            EngineEvent::Presence(_) => EventCategory::Presence,
            EngineEvent::ChatPresence(_) => EventCategory::ChatPresence,
            EngineEvent::HistorySync(_) => EventCategory::HistorySync,
            EngineEvent::AppState(_) => EventCategory::AppState,
            EngineEvent::AppStateSyncComplete(_) => EventCategory::AppStateSyncComplete,
            EngineEvent::Connected => EventCategory::Connected,
            EngineEvent::PushNameSetting => EventCategory::PushNameSetting,
            EngineEvent::PairSuccess(_) => EventCategory::PairSuccess,
            EngineEvent::StreamReplaced => EventCategory::StreamReplaced,
            EngineEvent::LoggedOut(_) => EventCategory::LoggedOut,
            EngineEvent::CallOffer(_) => EventCategory::CallOffer,
            EngineEvent::CallAccept(_) => EventCategory::CallAccept,
            EngineEvent::CallTerminate(_) => EventCategory::CallTerminate,
            EngineEvent::CallOfferNotice(_) => EventCategory::CallOfferNotice,
            EngineEvent::CallRelayLatency(_) => EventCategory::CallRelayLatency,
            EngineEvent::Disconnected | EngineEvent::Unknown { .. } => return None,
        };
        Some(c)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventCategory::Message => "Message",
            EventCategory::ReadReceipt => "ReadReceipt",
            EventCategory::Presence => "Presence",
            EventCategory::ChatPresence => "ChatPresence",
            EventCategory::HistorySync => "HistorySync",
            EventCategory::AppState => "AppState",
            EventCategory::AppStateSyncComplete => "AppStateSyncComplete",
            EventCategory::Connected => "Connected",
            EventCategory::PushNameSetting => "PushNameSetting",
            EventCategory::PairSuccess => "PairSuccess",
            EventCategory::StreamReplaced => "StreamReplaced",
            EventCategory::LoggedOut => "LoggedOut",
            EventCategory::CallOffer => "CallOffer",
            EventCategory::CallAccept => "CallAccept",
            EventCategory::CallTerminate => "CallTerminate",
            EventCategory::CallOfferNotice => "CallOfferNotice",
            EventCategory::CallRelayLatency => "CallRelayLatency",
        }
    }

    /// Categories a tenant can subscribe its webhook to.
    pub fn is_subscribable(self) -> bool {
        matches!(
            self,
            EventCategory::Message
                | EventCategory::ReadReceipt
                | EventCategory::Presence
                | EventCategory::ChatPresence
                | EventCategory::HistorySync
        )
    }
}

impl fmt::Display for EventCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventCategory {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

/// One entry of a tenant's subscription list.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Subscription {
    All,
    Category(EventCategory),
}

impl FromStr for Subscription {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let category = match s {
            "All" => return Ok(Subscription::All),
            "Message" => EventCategory::Message,
            "ReadReceipt" => EventCategory::ReadReceipt,
            "Presence" => EventCategory::Presence,
            "ChatPresence" => EventCategory::ChatPresence,
            "HistorySync" => EventCategory::HistorySync,
            other => return Err(other.to_string()),
        };
        Ok(Subscription::Category(category))
    }
}

impl fmt::Display for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subscription::All => f.write_str("All"),
            Subscription::Category(c) => f.write_str(c.as_str()),
        }
    }
}

/// Per-tenant set of subscribed categories gating webhook delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscriptions {
    set: BTreeSet<Subscription>,
}

impl Default for Subscriptions {
    fn default() -> Self {
        Self::all()
    }
}

impl Subscriptions {
    pub fn all() -> Self {
        Self {
            set: BTreeSet::from([Subscription::All]),
        }
    }

    /// Build from names. Unrecognized names are dropped with a warning; an empty
    /// result means `All`.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = BTreeSet::new();
        for raw in names {
            let name = raw.as_ref().trim();
            if name.is_empty() {
                continue;
            }
            match name.parse::<Subscription>() {
                Ok(sub) => {
                    set.insert(sub);
                }
                Err(_) => warn!(event_type = name, "Message type discarded"),
            }
        }
        if set.is_empty() {
            return Self::all();
        }
        Self { set }
    }

    /// Parse the persisted comma-joined list.
    pub fn parse_csv(csv: &str) -> Self {
        Self::from_names(csv.split(','))
    }

    pub fn allows(&self, category: EventCategory) -> bool {
        self.set.contains(&Subscription::All)
            || self.set.contains(&Subscription::Category(category))
    }

    pub fn to_csv(&self) -> String {
        self.set
            .iter()
            .map(|s| s.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
