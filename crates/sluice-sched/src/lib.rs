//! sluice-sched: bandwidth scheduling for peer connections.
//!
//! Token buckets meter each direction globally and per rate group. Every
//! connection starts in a shared pool per direction and can be upgraded to
//! a dedicated entity with its own limits. Two controller threads (read and
//! write) round-robin over the entities and sleep on an event waiter when
//! nothing moves.

pub mod average;
pub mod bucket;
pub mod conn_list;
pub mod controller;
pub mod cow;
pub mod diag;
pub mod download_pool;
pub mod entity;
pub mod entity_handler;
pub mod error;
pub mod rate_handler;
pub mod read_controller;
pub mod scheduler;
pub mod sim;
pub mod single;
pub mod transfer;
pub mod upload_pool;
pub mod write_controller;

#[cfg(test)]
mod test_support;

pub use bucket::ByteBucket;
pub use controller::ControllerStats;
pub use entity::{EntityController, Priority, RateControlledEntity, SharedEntity};
pub use error::SchedulerError;
pub use rate_handler::{Allowance, RateHandler, SharedRateHandler};
pub use read_controller::ReadController;
pub use scheduler::{DirectionStats, Scheduler, SchedulerStats};
pub use sim::SimConnection;
pub use transfer::{ConnectionState, TransferProcessor};
pub use write_controller::WriteController;
