//! Pieces shared by the read and write controllers.

use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use sluice_core::EventWaiter;

use crate::cow::CowList;
use crate::diag::IndentWriter;
use crate::entity::{same_entity, SharedEntity};

/// An entity as the controller holds it.
#[derive(Clone)]
pub struct Registered {
    pub entity: SharedEntity,
    pub partition_id: Option<u32>,
}

pub(crate) type EntityList = CowList<Registered>;

pub(crate) fn remove_from(list: &EntityList, entity: &SharedEntity) -> bool {
    list.remove_first(|r| same_entity(&r.entity, entity))
}

pub(crate) fn list_contains(list: &EntityList, entity: &SharedEntity) -> bool {
    list.contains(|r| same_entity(&r.entity, entity))
}

/// Round-robin: the first entity from `cursor` onwards that can process.
/// Advances `cursor` past every entity it looks at.
pub(crate) fn next_ready(
    list: &[Registered],
    cursor: &mut usize,
    waiter: &Arc<EventWaiter>,
) -> Option<SharedEntity> {
    for _ in 0..list.len() {
        if *cursor >= list.len() {
            *cursor = 0;
        }
        let candidate = &list[*cursor];
        *cursor += 1;
        if candidate.entity.can_process(waiter) {
            return Some(candidate.entity.clone());
        }
    }
    None
}

pub(crate) fn any_connections(lists: &[&EntityList]) -> bool {
    lists
        .iter()
        .any(|l| l.snapshot().iter().any(|r| r.entity.connection_count() > 0))
}

pub(crate) fn dump_list(w: &mut IndentWriter, label: &str, list: &EntityList) {
    let snapshot = list.snapshot();
    w.println(format!("{label} - {}", snapshot.len()));
    for r in snapshot.iter() {
        match r.partition_id {
            Some(p) => w.println(format!("[partition {p}] {}", r.entity.describe())),
            None => w.println(r.entity.describe()),
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Loop counters.
#[derive(Debug, Default)]
pub(crate) struct LoopCounters {
    pub wait: AtomicU64,
    pub progress: AtomicU64,
    pub non_progress: AtomicU64,
}

impl LoopCounters {
    pub fn waited(&self) {
        self.wait.fetch_add(1, Ordering::Relaxed);
    }

    pub fn progressed(&self) {
        self.progress.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stalled(&self) {
        self.non_progress.fetch_add(1, Ordering::Relaxed);
    }
}

/// Point-in-time controller statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ControllerStats {
    pub entity_count: usize,
    pub connection_count: usize,
    pub ready_connection_count: usize,
    /// Write side only.
    pub ready_bytes: usize,
    pub wait_count: u64,
    pub progress_count: u64,
    pub non_progress_count: u64,
}

pub(crate) fn collect_stats(
    counters: &LoopCounters,
    lists: &[&EntityList],
    waiter: &Arc<EventWaiter>,
    count_ready_bytes: bool,
) -> ControllerStats {
    let mut stats = ControllerStats {
        wait_count: counters.wait.load(Ordering::Relaxed),
        progress_count: counters.progress.load(Ordering::Relaxed),
        non_progress_count: counters.non_progress.load(Ordering::Relaxed),
        ..ControllerStats::default()
    };
    for list in lists {
        for r in list.snapshot().iter() {
            stats.entity_count += 1;
            stats.connection_count += r.entity.connection_count();
            stats.ready_connection_count += r.entity.ready_connection_count(waiter);
            if count_ready_bytes {
                stats.ready_bytes += r.entity.bytes_ready_to_write();
            }
        }
    }
    stats
}
