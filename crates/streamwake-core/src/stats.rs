use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::normalizer::DropReason;

/// Counters for a single event type
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TypeCounts {
    pub received: u64,
    pub emitted: u64,
    pub noise: u64,
    pub self_authored: u64,
    pub unknown: u64,
    pub duplicate: u64,
}

/// Stats for deliveries received from the stream
#[derive(Debug, Default, Clone)]
pub struct EventStats {
    /// Counts by event type name. Empty string means the publication had no type.
    pub by_type: BTreeMap<String, TypeCounts>,
    pub wakes_triggered: u64,
    pub wakes_suppressed: u64,
    pub wakes_failed: u64,
    /// Total deliveries received
    pub total: u64,
}

impl EventStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, event: &str) -> &mut TypeCounts {
        self.by_type.entry(event.to_string()).or_default()
    }

    pub fn record_received(&mut self, event: &str) {
        self.total += 1;
        self.entry(event).received += 1;
    }

    pub fn record_emitted(&mut self, event: &str) {
        self.entry(event).emitted += 1;
    }

    pub fn record_dropped(&mut self, event: &str, reason: DropReason) {
        let counts = self.entry(event);
        match reason {
            DropReason::Noise => counts.noise += 1,
            DropReason::SelfAuthored => counts.self_authored += 1,
            DropReason::UnknownType => counts.unknown += 1,
        }
    }

    pub fn record_duplicate(&mut self, event: &str) {
        self.entry(event).duplicate += 1;
    }

    /// Deliveries whose type is outside the known taxonomy
    pub fn unhandled(&self) -> u64 {
        self.by_type.values().map(|c| c.unknown).sum()
    }

    pub fn emitted(&self) -> u64 {
        self.by_type.values().map(|c| c.emitted).sum()
    }

    /// One-line summary for the diagnostic log
    pub fn summary(&self) -> String {
        let mut kinds: Vec<_> = self
            .by_type
            .iter()
            .filter(|(_, c)| c.received > 0)
            .map(|(name, c)| {
                let name = if name.is_empty() { "<untyped>" } else { name.as_str() };
                (name, c.received)
            })
            .collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1));
        let per_type = kinds
            .iter()
            .map(|(name, count)| format!("{}={}", name, count))
            .collect::<Vec<_>>()
            .join(" ");

        format!(
            "received={} emitted={} unhandled={} wakes={} suppressed={} wake_failures={} [{}]",
            self.total,
            self.emitted(),
            self.unhandled(),
            self.wakes_triggered,
            self.wakes_suppressed,
            self.wakes_failed,
            per_type
        )
    }
}

/// Thread-safe wrapper for event stats
#[derive(Debug, Clone, Default)]
pub struct SharedEventStats {
    inner: Arc<RwLock<EventStats>>,
}

impl SharedEventStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut EventStats)) {
        f(&mut self.inner.write());
    }

    pub fn snapshot(&self) -> EventStats {
        self.inner.read().clone()
    }
}
