//! sluice-core — shared types, configuration, and the transport boundary.
//! The scheduler crate and the daemon both depend on this one.

pub mod clock;
pub mod config;
pub mod event;
pub mod limits;
pub mod settings;
pub mod transport;

pub use clock::{Clock, ManualClock, MonotonicClock, SharedClock};
pub use event::EventWaiter;
pub use limits::{effective_rate, GroupId, RateGroup, RateGroupRegistry, UNLIMITED_RATE};
pub use settings::LiveSettings;
pub use transport::{
    Connection, ConnectionId, Direction, QueueListener, Readiness, SharedConnection,
    TransferError, Transferred,
};
