//! Duplicate suppression and per-channel wake cooldown.
//!
//! Both tables use `tokio::time::Instant` so the windows follow the runtime
//! clock. Each read-check-insert happens under one lock, so two racing
//! deliveries of the same event can never both pass.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::constants::{DEDUP_PREVIEW_CHARS, DEDUP_WINDOW};
use crate::models::{EventType, NormalizedEvent};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    event: EventType,
    author: String,
    preview_prefix: String,
}

impl DedupKey {
    fn of(event: &NormalizedEvent) -> Self {
        Self {
            event: event.event.clone(),
            author: event.author.clone(),
            preview_prefix: event.preview.chars().take(DEDUP_PREVIEW_CHARS).collect(),
        }
    }
}

/// Short-lived set of recently delivered events
#[derive(Debug)]
pub struct DedupWindow {
    ttl: Duration,
    expires: Mutex<HashMap<DedupKey, Instant>>,
}

impl Default for DedupWindow {
    fn default() -> Self {
        Self::new(DEDUP_WINDOW)
    }
}

impl DedupWindow {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            expires: Mutex::new(HashMap::new()),
        }
    }

    /// True when an identical event was seen within the window. Otherwise
    /// the event is remembered and false is returned.
    pub fn is_duplicate(&self, event: &NormalizedEvent) -> bool {
        let now = Instant::now();
        let key = DedupKey::of(event);
        let mut expires = self.expires.lock();
        expires.retain(|_, deadline| *deadline > now);
        if expires.contains_key(&key) {
            return true;
        }
        expires.insert(key, now + self.ttl);
        false
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.expires.lock().len()
    }
}

/// Last wake per channel label. Entries are never evicted.
#[derive(Debug)]
pub struct CooldownTable {
    cooldown: Duration,
    last_wake: Mutex<HashMap<String, Instant>>,
}

impl CooldownTable {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_wake: Mutex::new(HashMap::new()),
        }
    }

    /// Priority events always wake and leave the table untouched. Other
    /// events wake at most once per cooldown per channel label.
    pub fn should_wake(&self, event: &NormalizedEvent) -> bool {
        if event.event.is_priority() {
            return true;
        }
        let now = Instant::now();
        let mut last_wake = self.last_wake.lock();
        if let Some(last) = last_wake.get(&event.channel) {
            if now.duration_since(*last) < self.cooldown {
                return false;
            }
        }
        last_wake.insert(event.channel.clone(), now);
        true
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.last_wake.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: EventType, channel: &str, author: &str, preview: &str) -> NormalizedEvent {
        NormalizedEvent {
            event: kind,
            channel: channel.to_string(),
            author: author.to_string(),
            preview: preview.to_string(),
            is_agent: false,
            ts: "2024-01-01T00:00:00+00:00".to_string(),
            auto_subscribe: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_within_window_then_expiry() {
        let window = DedupWindow::default();
        let e = event(EventType::MentionReceived, "#general", "alice", "hi");

        assert!(!window.is_duplicate(&e));
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(window.is_duplicate(&e));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!window.is_duplicate(&e));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dedup_ignores_channel_and_uses_preview_prefix() {
        let window = DedupWindow::default();
        let prefix = "x".repeat(DEDUP_PREVIEW_CHARS);

        let on_channel = event(EventType::MentionReceived, "#general", "alice", &format!("{prefix}one"));
        let on_personal = event(EventType::MentionReceived, "DM", "alice", &format!("{prefix}two"));
        assert!(!window.is_duplicate(&on_channel));
        assert!(window.is_duplicate(&on_personal));

        let other_author = event(EventType::MentionReceived, "#general", "bob", &prefix);
        let other_type = event(EventType::MessageSent, "#general", "alice", &prefix);
        assert!(!window.is_duplicate(&other_author));
        assert!(!window.is_duplicate(&other_type));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_pruned() {
        let window = DedupWindow::new(Duration::from_secs(1));
        window.is_duplicate(&event(EventType::MessageSent, "#a", "x", "1"));
        window.is_duplicate(&event(EventType::MessageSent, "#a", "x", "2"));
        assert_eq!(window.len(), 2);

        tokio::time::advance(Duration::from_secs(2)).await;
        window.is_duplicate(&event(EventType::MessageSent, "#a", "x", "3"));
        assert_eq!(window.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_second_wake() {
        let table = CooldownTable::new(Duration::from_secs(30));
        let e = event(EventType::MessageSent, "#general", "alice", "hi");

        assert!(table.should_wake(&e));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!table.should_wake(&e));

        let elsewhere = event(EventType::MessageSent, "#random", "alice", "hi");
        assert!(table.should_wake(&elsewhere));

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(table.should_wake(&e));
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_events_bypass_and_do_not_consume_cooldown() {
        let table = CooldownTable::new(Duration::from_secs(30));
        let mention = event(EventType::MentionReceived, "#general", "alice", "hi");
        let message = event(EventType::MessageSent, "#general", "bob", "yo");

        assert!(table.should_wake(&mention));
        assert!(table.should_wake(&mention));
        assert!(table.is_empty());

        assert!(table.should_wake(&message));
        assert!(!table.should_wake(&message));
        assert!(table.should_wake(&mention));
    }
}
