//! Raw publication → [`NormalizedEvent`].
//!
//! Each delivery goes through the noise filter, the self-origin filter and a
//! fixed per-type projection. Missing fields degrade to defaults instead of
//! failing.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::constants::{ELLIPSIS, PREVIEW_MAX_CHARS, UNKNOWN_AUTHOR};
use crate::models::json_utils::{id_at, str_at, value_at};
use crate::models::{EventType, NormalizedEvent, RawEvent};
use crate::resolver::ChannelLabels;

/// Why a delivery produced no event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    Noise,
    SelfAuthored,
    UnknownType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Emit(NormalizedEvent),
    Dropped { event: EventType, reason: DropReason },
}

/// Payload paths for one classified event type
struct Projection {
    author: &'static str,
    preview: &'static str,
    timestamp: &'static str,
    /// Key prefix and id path of the key to auto-subscribe
    auto_subscribe: Option<(&'static str, &'static str)>,
}

fn projection(event: &EventType) -> Option<Projection> {
    let p = match event {
        EventType::MessageSent | EventType::DmMessageReceived => Projection {
            author: "message.author",
            preview: "message.content",
            timestamp: "message.createdAt",
            auto_subscribe: None,
        },
        EventType::MentionReceived => Projection {
            author: "author",
            preview: "content",
            timestamp: "createdAt",
            auto_subscribe: None,
        },
        EventType::DmCreated => Projection {
            author: "createdBy",
            preview: "dm.name",
            timestamp: "dm.createdAt",
            auto_subscribe: Some(("channel", "dm.id")),
        },
        EventType::ReactionAdded => Projection {
            author: "user",
            preview: "emoji",
            timestamp: "createdAt",
            auto_subscribe: None,
        },
        EventType::ThreadCreated => Projection {
            author: "thread.creator",
            preview: "thread.name",
            timestamp: "thread.createdAt",
            auto_subscribe: Some(("thread", "thread.id")),
        },
        _ => return None,
    };
    Some(p)
}

struct Author {
    id: Option<String>,
    name: String,
    is_agent: bool,
}

fn author_at(payload: &Value, path: &str) -> Author {
    let Some(value) = value_at(payload, path) else {
        return Author {
            id: None,
            name: UNKNOWN_AUTHOR.to_string(),
            is_agent: false,
        };
    };
    if let Some(name) = value.as_str() {
        return Author {
            id: Some(name.to_string()),
            name: name.to_string(),
            is_agent: false,
        };
    }
    let name = ["name", "displayName", "username"]
        .iter()
        .find_map(|field| value.get(*field).and_then(Value::as_str))
        .filter(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_AUTHOR);
    Author {
        id: id_at(value, "id"),
        name: name.to_string(),
        is_agent: value.get("isAgent").and_then(Value::as_bool).unwrap_or(false),
    }
}

/// RFC 3339 strings are normalized to UTC; numbers are epoch milliseconds.
/// Anything unusable falls back to now.
fn timestamp_at(payload: &Value, path: &str) -> String {
    let parsed = match value_at(payload, path) {
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok(),
        Some(Value::Number(n)) => n.as_i64().and_then(DateTime::<Utc>::from_timestamp_millis),
        _ => None,
    };
    parsed.unwrap_or_else(Utc::now).to_rfc3339()
}

/// Cut `text` to at most `max_chars` characters, marking the cut
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

pub struct Normalizer {
    agent_id: String,
    labels: ChannelLabels,
}

impl Normalizer {
    pub fn new(agent_id: impl Into<String>, labels: ChannelLabels) -> Self {
        Self {
            agent_id: agent_id.into(),
            labels,
        }
    }

    /// Normalize publication data received on subscription `key`
    pub fn normalize_publication(&self, key: &str, data: &Value) -> Outcome {
        match RawEvent::from_publication(data) {
            Some(raw) => self.normalize(key, &raw),
            None => Outcome::Dropped {
                event: EventType::Other(String::new()),
                reason: DropReason::UnknownType,
            },
        }
    }

    pub fn normalize(&self, key: &str, raw: &RawEvent) -> Outcome {
        let event = raw.event_type();
        if event.is_noise() {
            return Outcome::Dropped {
                event,
                reason: DropReason::Noise,
            };
        }
        let Some(projection) = projection(&event) else {
            return Outcome::Dropped {
                event,
                reason: DropReason::UnknownType,
            };
        };

        let payload = &raw.payload;
        let author = author_at(payload, projection.author);
        if event.is_self_filtered() && author.id.as_deref() == Some(self.agent_id.as_str()) {
            return Outcome::Dropped {
                event,
                reason: DropReason::SelfAuthored,
            };
        }

        let preview = str_at(payload, projection.preview).unwrap_or_default();
        let auto_subscribe = projection
            .auto_subscribe
            .and_then(|(prefix, id_path)| id_at(payload, id_path).map(|id| format!("{}.{}", prefix, id)));

        Outcome::Emit(NormalizedEvent {
            channel: self.labels.resolve(key),
            author: author.name,
            preview: truncate_chars(preview, PREVIEW_MAX_CHARS),
            is_agent: author.is_agent,
            ts: timestamp_at(payload, projection.timestamp),
            auto_subscribe,
            event,
        })
    }
}
