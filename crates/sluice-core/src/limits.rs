//! Rate groups: named limits shared by many connections.
//!
//! A configured limit is an `i64` in bytes/sec:
//!   0       : unlimited (mapped to `UNLIMITED_RATE`)
//!   negative: transfers disabled (mapped to 0)
//!   positive: the limit itself
//!
//! Limits live in atomics so an operator can change them while the
//! scheduler threads are running; the next tick picks the new value up.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::config::GroupLimit;
use crate::transport::Direction;

/// Anything at or above this is treated as "no limit" by the buckets.
pub const UNLIMITED_RATE: u64 = 100 * 1024 * 1024;

/// Map a configured limit to the rate a bucket should run at.
pub fn effective_rate(limit: i64) -> u64 {
    match limit {
        0 => UNLIMITED_RATE,
        l if l < 0 => 0,
        l => l as u64,
    }
}

pub type GroupId = u64;

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// A named, shareable limit.
#[derive(Debug)]
pub struct RateGroup {
    id: GroupId,
    name: String,
    limit: AtomicI64,
    bytes_used: AtomicU64,
}

impl RateGroup {
    pub fn new(name: impl Into<String>, limit: i64) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            limit: AtomicI64::new(limit),
            bytes_used: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured limit, before sentinel mapping.
    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn effective_rate(&self) -> u64 {
        effective_rate(self.limit())
    }

    pub fn is_disabled(&self) -> bool {
        self.limit() < 0
    }

    /// Running total of bytes charged against this group.
    pub fn update_bytes_used(&self, bytes: usize) {
        self.bytes_used.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn bytes_used(&self) -> u64 {
        self.bytes_used.load(Ordering::Relaxed)
    }
}

/// Registry of named groups, one `RateGroup` per (name, direction).
///
/// Clones share the same underlying map.
#[derive(Clone, Default)]
pub struct RateGroupRegistry {
    groups: Arc<DashMap<(String, Direction), Arc<RateGroup>>>,
}

impl RateGroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a group, creating it unlimited if it does not exist yet.
    pub fn get_or_create(&self, name: &str, direction: Direction) -> Arc<RateGroup> {
        self.groups
            .entry((name.to_string(), direction))
            .or_insert_with(|| RateGroup::new(format!("{name}/{direction}"), 0))
            .clone()
    }

    pub fn get(&self, name: &str, direction: Direction) -> Option<Arc<RateGroup>> {
        self.groups
            .get(&(name.to_string(), direction))
            .map(|g| g.value().clone())
    }

    /// Change a group's limit; creates the group if needed.
    pub fn set_limit(&self, name: &str, direction: Direction, limit: i64) {
        let group = self.get_or_create(name, direction);
        group.set_limit(limit);
        tracing::info!(group = %group.name(), limit, "group limit changed");
    }

    /// Apply `[[limits.groups]]` entries from config.
    pub fn apply_config(&self, groups: &[GroupLimit]) {
        for g in groups {
            self.get_or_create(&g.name, Direction::Upload)
                .set_limit(g.upload_bytes_per_sec);
            self.get_or_create(&g.name, Direction::Download)
                .set_limit(g.download_bytes_per_sec);
        }
        if !groups.is_empty() {
            tracing::info!(count = groups.len(), "rate groups configured");
        }
    }

    /// All groups, sorted by display name.
    pub fn list(&self) -> Vec<Arc<RateGroup>> {
        let mut all: Vec<_> = self.groups.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
