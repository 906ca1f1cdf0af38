//! Coordinator counters.
//!
//! Counters are updated by the coordinator thread and read from anywhere
//! through [`BrainStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    value: AtomicU64,
    name: &'static str,
}

impl Counter {
    pub const fn new(name: &'static str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name,
        }
    }

    /// Increment the counter by 1.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a value to the counter.
    pub fn add(&self, v: u64) {
        if v > 0 {
            self.value.fetch_add(v, Ordering::Relaxed);
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Everything one coordinator counts.
#[derive(Debug)]
pub struct BrainStats {
    pub connections_opened: Counter,
    pub connections_closed: Counter,
    pub links_opened: Counter,
    pub link_failures: Counter,
    pub recoveries: Counter,
    pub packets_retransmitted: Counter,
    pub duplicates_dropped: Counter,
    pub stale_commands: Counter,
    pub protocol_violations: Counter,
}

impl Default for BrainStats {
    fn default() -> Self {
        Self::new()
    }
}

impl BrainStats {
    pub const fn new() -> Self {
        Self {
            connections_opened: Counter::new("connections_opened"),
            connections_closed: Counter::new("connections_closed"),
            links_opened: Counter::new("links_opened"),
            link_failures: Counter::new("link_failures"),
            recoveries: Counter::new("recoveries"),
            packets_retransmitted: Counter::new("packets_retransmitted"),
            duplicates_dropped: Counter::new("duplicates_dropped"),
            stale_commands: Counter::new("stale_commands"),
            protocol_violations: Counter::new("protocol_violations"),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.get(),
            connections_closed: self.connections_closed.get(),
            links_opened: self.links_opened.get(),
            link_failures: self.link_failures.get(),
            recoveries: self.recoveries.get(),
            packets_retransmitted: self.packets_retransmitted.get(),
            duplicates_dropped: self.duplicates_dropped.get(),
            stale_commands: self.stale_commands.get(),
            protocol_violations: self.protocol_violations.get(),
        }
    }
}

/// Point-in-time copy of [`BrainStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub links_opened: u64,
    pub link_failures: u64,
    pub recoveries: u64,
    pub packets_retransmitted: u64,
    pub duplicates_dropped: u64,
    pub stale_commands: u64,
    pub protocol_violations: u64,
}
