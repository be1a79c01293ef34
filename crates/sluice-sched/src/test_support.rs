//! Shared fixtures for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{EventWaiter, ManualClock, SharedClock};

use crate::entity::{same_entity, EntityController, Priority, RateControlledEntity, SharedEntity};
use crate::rate_handler::{Allowance, RateHandler, SharedRateHandler};

/// A rate handler with a settable allowance that records what it is charged.
pub struct FixedRateHandler {
    allowance: AtomicUsize,
    protocol_is_free: bool,
    pub data: AtomicUsize,
    pub protocol: AtomicUsize,
}

impl FixedRateHandler {
    pub fn new(bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            allowance: AtomicUsize::new(bytes),
            protocol_is_free: true,
            data: AtomicUsize::new(0),
            protocol: AtomicUsize::new(0),
        })
    }

    pub fn set(&self, bytes: usize) {
        self.allowance.store(bytes, Ordering::Relaxed);
    }

    pub fn charged(&self) -> usize {
        self.data.load(Ordering::Relaxed) + self.protocol.load(Ordering::Relaxed)
    }
}

impl RateHandler for FixedRateHandler {
    fn current_allowance(&self) -> Allowance {
        Allowance {
            bytes: self.allowance.load(Ordering::Relaxed),
            protocol_is_free: self.protocol_is_free,
        }
    }

    fn bytes_processed(&self, data_bytes: usize, protocol_bytes: usize) {
        self.data.fetch_add(data_bytes, Ordering::Relaxed);
        self.protocol.fetch_add(protocol_bytes, Ordering::Relaxed);
    }
}

pub fn manual_clock() -> (Arc<ManualClock>, SharedClock) {
    let clock = Arc::new(ManualClock::new(1_000));
    let shared: SharedClock = clock.clone();
    (clock, shared)
}

/// An entity controller that only records what it is given.
#[derive(Default)]
pub struct RecordingController {
    pub entities: Mutex<Vec<(SharedEntity, Option<u32>)>>,
}

impl EntityController for RecordingController {
    fn add_entity(&self, entity: SharedEntity, partition_id: Option<u32>) {
        self.entities.lock().push((entity, partition_id));
    }

    fn remove_entity(&self, entity: &SharedEntity) -> bool {
        let mut entities = self.entities.lock();
        match entities.iter().position(|(e, _)| same_entity(e, entity)) {
            Some(pos) => {
                entities.remove(pos);
                true
            }
            None => false,
        }
    }

    fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }
}

/// An entity with scripted readiness and results that counts its calls.
pub struct ScriptedEntity {
    priority: Priority,
    pub boost: AtomicBool,
    pub ready: AtomicBool,
    pub panics: AtomicBool,
    /// Bytes reported per `do_processing`, capped by the offered maximum.
    pub yield_bytes: AtomicUsize,
    pub ready_bytes: AtomicUsize,
    pub calls: AtomicUsize,
    pub offered: Mutex<Vec<Option<usize>>>,
}

impl ScriptedEntity {
    pub fn new(priority: Priority, yield_bytes: usize) -> Arc<Self> {
        Arc::new(Self {
            priority,
            boost: AtomicBool::new(false),
            ready: AtomicBool::new(true),
            panics: AtomicBool::new(false),
            yield_bytes: AtomicUsize::new(yield_bytes),
            ready_bytes: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            offered: Mutex::new(Vec::new()),
        })
    }

    pub fn boosted(yield_bytes: usize) -> Arc<Self> {
        let e = Self::new(Priority::Normal, yield_bytes);
        e.boost.store(true, Ordering::Relaxed);
        e
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }
}

impl RateControlledEntity for ScriptedEntity {
    fn can_process(&self, _waiter: &Arc<EventWaiter>) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn do_processing(&self, _waiter: &Arc<EventWaiter>, max_bytes: Option<usize>) -> usize {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.offered.lock().push(max_bytes);
        if self.panics.load(Ordering::Relaxed) {
            panic!("scripted failure");
        }
        let bytes = self.yield_bytes.load(Ordering::Relaxed);
        max_bytes.map_or(bytes, |max| bytes.min(max))
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn priority_boost(&self) -> bool {
        self.boost.load(Ordering::Relaxed)
    }

    fn rate_handler(&self) -> SharedRateHandler {
        FixedRateHandler::new(0)
    }

    fn bytes_ready_to_write(&self) -> usize {
        self.ready_bytes.load(Ordering::Relaxed)
    }

    fn connection_count(&self) -> usize {
        1
    }

    fn ready_connection_count(&self, _waiter: &Arc<EventWaiter>) -> usize {
        usize::from(self.ready.load(Ordering::Relaxed))
    }

    fn describe(&self) -> String {
        format!("scripted {:?}", self.priority)
    }
}
