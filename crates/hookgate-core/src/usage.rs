//! Usage counters.
//!
//! The set of counters is closed: callers name a counter through [`UsageCounter`],
//! never through a free-form column string.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{domain::MessageCounters, engine::types::MessageKind, errors::Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageCounter {
    Text,
    Image,
    Voice,
    Video,
    Sticker,
    Location,
    Contact,
    Document,
    /// Not a counter: flips the day's online flag.
    Online,
}

impl UsageCounter {
    pub const MESSAGE_COUNTERS: [UsageCounter; 8] = [
        UsageCounter::Text,
        UsageCounter::Image,
        UsageCounter::Voice,
        UsageCounter::Video,
        UsageCounter::Sticker,
        UsageCounter::Location,
        UsageCounter::Contact,
        UsageCounter::Document,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            UsageCounter::Text => "text",
            UsageCounter::Image => "image",
            UsageCounter::Voice => "voice",
            UsageCounter::Video => "video",
            UsageCounter::Sticker => "sticker",
            UsageCounter::Location => "location",
            UsageCounter::Contact => "contact",
            UsageCounter::Document => "document",
            UsageCounter::Online => "online",
        }
    }

    /// Storage column for message counters; `None` for [`UsageCounter::Online`].
    pub fn column(self) -> Option<&'static str> {
        match self {
            UsageCounter::Text => Some("count_text_msg"),
            UsageCounter::Image => Some("count_image_msg"),
            UsageCounter::Voice => Some("count_voice_msg"),
            UsageCounter::Video => Some("count_video_msg"),
            UsageCounter::Sticker => Some("count_sticker_msg"),
            UsageCounter::Location => Some("count_location_msg"),
            UsageCounter::Contact => Some("count_contact_msg"),
            UsageCounter::Document => Some("count_document_msg"),
            UsageCounter::Online => None,
        }
    }

    /// Counter bumped for an inbound message of the given kind.
    pub fn for_message(kind: MessageKind) -> Option<Self> {
        match kind {
            MessageKind::Text => Some(UsageCounter::Text),
            MessageKind::Image => Some(UsageCounter::Image),
            MessageKind::Audio => Some(UsageCounter::Voice),
            MessageKind::Video => Some(UsageCounter::Video),
            MessageKind::Sticker => Some(UsageCounter::Sticker),
            MessageKind::Location => Some(UsageCounter::Location),
            MessageKind::Contact => Some(UsageCounter::Contact),
            MessageKind::Document => Some(UsageCounter::Document),
            MessageKind::Other => None,
        }
    }

    /// Increment the matching field. No-op for [`UsageCounter::Online`].
    pub fn bump(self, counters: &mut MessageCounters) {
        let slot = match self {
            UsageCounter::Text => &mut counters.text,
            UsageCounter::Image => &mut counters.image,
            UsageCounter::Voice => &mut counters.voice,
            UsageCounter::Video => &mut counters.video,
            UsageCounter::Sticker => &mut counters.sticker,
            UsageCounter::Location => &mut counters.location,
            UsageCounter::Contact => &mut counters.contact,
            UsageCounter::Document => &mut counters.document,
            UsageCounter::Online => return,
        };
        *slot += 1;
    }
}

impl fmt::Display for UsageCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UsageCounter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(UsageCounter::Text),
            "image" => Ok(UsageCounter::Image),
            "voice" => Ok(UsageCounter::Voice),
            "video" => Ok(UsageCounter::Video),
            "sticker" => Ok(UsageCounter::Sticker),
            "location" => Ok(UsageCounter::Location),
            "contact" => Ok(UsageCounter::Contact),
            "document" => Ok(UsageCounter::Document),
            "online" => Ok(UsageCounter::Online),
            _ => Err(Error::InvalidCounter(s.to_string())),
        }
    }
}
