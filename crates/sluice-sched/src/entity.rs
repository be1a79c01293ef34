//! Scheduled entities and the controllers that poll them.

use std::sync::Arc;

use serde::Serialize;
use sluice_core::EventWaiter;

use crate::rate_handler::SharedRateHandler;

/// Priority class. Controllers keep one entity list per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// A unit the read or write controller schedules: either one dedicated
/// connection or a pool multiplexing many.
pub trait RateControlledEntity: Send + Sync {
    /// Cheap check whether `do_processing` could move bytes right now.
    fn can_process(&self, waiter: &Arc<EventWaiter>) -> bool;

    /// Move bytes. `max_bytes` further caps the rate handler's allowance.
    /// Returns bytes moved; I/O failures count as zero.
    fn do_processing(&self, waiter: &Arc<EventWaiter>, max_bytes: Option<usize>) -> usize;

    fn priority(&self) -> Priority;

    /// Write side only: the entity asks for the boosted class.
    fn priority_boost(&self) -> bool {
        false
    }

    fn rate_handler(&self) -> SharedRateHandler;

    /// Queued bytes across this entity's connections.
    fn bytes_ready_to_write(&self) -> usize {
        0
    }

    fn connection_count(&self) -> usize;

    fn ready_connection_count(&self, waiter: &Arc<EventWaiter>) -> usize;

    fn describe(&self) -> String;
}

pub type SharedEntity = Arc<dyn RateControlledEntity>;

/// Entities compare by identity.
pub fn same_entity(a: &SharedEntity, b: &SharedEntity) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Where the entity handler registers its entities.
pub trait EntityController: Send + Sync {
    /// `partition_id` groups entities for fairness; recorded, not interpreted.
    fn add_entity(&self, entity: SharedEntity, partition_id: Option<u32>);

    /// Returns whether the entity was registered.
    fn remove_entity(&self, entity: &SharedEntity) -> bool;

    fn entity_count(&self) -> usize;
}
