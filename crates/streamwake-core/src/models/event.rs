use std::fmt;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::constants::events;

/// Classified event type. Anything outside the known taxonomy lands in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    MessageSent,
    MentionReceived,
    DmCreated,
    DmMessageReceived,
    ReactionAdded,
    ThreadCreated,
    TypingStarted,
    TypingStopped,
    MessageUpdated,
    MessageDeleted,
    ReactionRemoved,
    ThreadUpdated,
    Other(String),
}

impl EventType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            events::MESSAGE_SENT => EventType::MessageSent,
            events::MENTION_RECEIVED => EventType::MentionReceived,
            events::DM_CREATED => EventType::DmCreated,
            events::DM_MESSAGE_RECEIVED => EventType::DmMessageReceived,
            events::REACTION_ADDED => EventType::ReactionAdded,
            events::THREAD_CREATED => EventType::ThreadCreated,
            events::TYPING_STARTED => EventType::TypingStarted,
            events::TYPING_STOPPED => EventType::TypingStopped,
            events::MESSAGE_UPDATED => EventType::MessageUpdated,
            events::MESSAGE_DELETED => EventType::MessageDeleted,
            events::REACTION_REMOVED => EventType::ReactionRemoved,
            events::THREAD_UPDATED => EventType::ThreadUpdated,
            other => EventType::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            EventType::MessageSent => events::MESSAGE_SENT,
            EventType::MentionReceived => events::MENTION_RECEIVED,
            EventType::DmCreated => events::DM_CREATED,
            EventType::DmMessageReceived => events::DM_MESSAGE_RECEIVED,
            EventType::ReactionAdded => events::REACTION_ADDED,
            EventType::ThreadCreated => events::THREAD_CREATED,
            EventType::TypingStarted => events::TYPING_STARTED,
            EventType::TypingStopped => events::TYPING_STOPPED,
            EventType::MessageUpdated => events::MESSAGE_UPDATED,
            EventType::MessageDeleted => events::MESSAGE_DELETED,
            EventType::ReactionRemoved => events::REACTION_REMOVED,
            EventType::ThreadUpdated => events::THREAD_UPDATED,
            EventType::Other(raw) => raw,
        }
    }

    /// Intentionally ignored signal, dropped before anything else
    pub fn is_noise(&self) -> bool {
        matches!(
            self,
            EventType::TypingStarted
                | EventType::TypingStopped
                | EventType::MessageUpdated
                | EventType::MessageDeleted
                | EventType::ReactionRemoved
                | EventType::ThreadUpdated
        )
    }

    /// Event types dropped when authored by the agent itself
    pub fn is_self_filtered(&self) -> bool {
        matches!(
            self,
            EventType::MessageSent | EventType::MentionReceived | EventType::ReactionAdded
        )
    }

    /// Priority events always wake and never touch the cooldown table
    pub fn is_priority(&self) -> bool {
        matches!(
            self,
            EventType::MentionReceived | EventType::DmCreated | EventType::DmMessageReceived
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Publication data as it arrives on a subscription
#[derive(Debug, Clone, Deserialize)]
pub struct RawEvent {
    #[serde(alias = "type")]
    pub event: String,
    #[serde(default, alias = "data")]
    pub payload: Value,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    /// Decode publication data; `None` when it carries no event type
    pub fn from_publication(data: &Value) -> Option<Self> {
        serde_json::from_value(data.clone()).ok()
    }

    pub fn event_type(&self) -> EventType {
        EventType::parse(&self.event)
    }
}

/// One line of the output stream. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedEvent {
    pub event: EventType,
    pub channel: String,
    pub author: String,
    pub preview: String,
    pub is_agent: bool,
    pub ts: String,
    #[serde(skip)]
    pub auto_subscribe: Option<String>,
}

impl NormalizedEvent {
    /// Serialize as a single JSON line (no trailing newline)
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_type_roundtrips_known_names() {
        for name in ["MentionReceived", "ThreadCreated", "TypingStarted"] {
            assert_eq!(EventType::parse(name).as_str(), name);
        }
        assert_eq!(EventType::parse("Wave"), EventType::Other("Wave".to_string()));
    }

    #[test]
    fn test_priority_and_noise_sets_are_disjoint() {
        let all = [
            "MessageSent",
            "MentionReceived",
            "DmCreated",
            "DmMessageReceived",
            "ReactionAdded",
            "ThreadCreated",
            "TypingStarted",
            "TypingStopped",
            "MessageUpdated",
            "MessageDeleted",
            "ReactionRemoved",
            "ThreadUpdated",
        ];
        for name in all {
            let t = EventType::parse(name);
            assert!(!(t.is_noise() && t.is_priority()), "{name}");
        }
    }

    #[test]
    fn test_raw_event_accepts_aliases() {
        let raw = RawEvent::from_publication(&json!({"type": "DmCreated", "data": {"dm": {"id": 3}}})).unwrap();
        assert_eq!(raw.event_type(), EventType::DmCreated);
        assert_eq!(raw.payload["dm"]["id"], 3);

        assert!(RawEvent::from_publication(&json!({"payload": {}})).is_none());
    }

    #[test]
    fn test_output_line_has_fixed_fields() {
        let event = NormalizedEvent {
            event: EventType::MentionReceived,
            channel: "#general".to_string(),
            author: "alice".to_string(),
            preview: "hi".to_string(),
            is_agent: false,
            ts: "2024-01-01T00:00:00+00:00".to_string(),
            auto_subscribe: Some("thread.1".to_string()),
        };
        let line: Value = serde_json::from_str(&event.to_json_line().unwrap()).unwrap();
        let obj = line.as_object().unwrap();
        let mut keys: Vec<_> = obj.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["author", "channel", "event", "isAgent", "preview", "ts"]);
        assert_eq!(obj["event"], "MentionReceived");
    }
}
