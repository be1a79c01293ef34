//! The transport boundary.
//!
//! The scheduler never touches sockets, message framing or crypto. It sees a
//! connection only through the `Connection` trait below: readiness checks,
//! opaque byte moves bounded by a quota, an outgoing-queue size, and a
//! failure callback. Whatever sits behind it (TCP, uTP, a test double) is
//! outside this workspace's concern.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::event::EventWaiter;
use crate::limits::RateGroup;

/// Stable identifier for a connection, unique for the life of the process.
pub type ConnectionId = u64;

/// Transfer direction. Each direction gets its own processor and controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => f.write_str("upload"),
            Direction::Download => f.write_str("download"),
        }
    }
}

/// Result of a read-readiness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Not readable; `stale_for` is how long it has been since it last was.
    NotReady { stale_for: Duration },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// Milliseconds since last ready, 0 when ready now.
    pub fn stale_ms(&self) -> u64 {
        match self {
            Readiness::Ready => 0,
            Readiness::NotReady { stale_for } => stale_for.as_millis() as u64,
        }
    }
}

/// Bytes moved by one transport call, split into payload and protocol overhead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transferred {
    pub data_bytes: usize,
    pub protocol_bytes: usize,
}

impl Transferred {
    pub fn new(data_bytes: usize, protocol_bytes: usize) -> Self {
        Self {
            data_bytes,
            protocol_bytes,
        }
    }

    pub fn total(&self) -> usize {
        self.data_bytes + self.protocol_bytes
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed")]
    Closed,
    #[error("protocol failure: {0}")]
    Protocol(String),
}

/// Watches a connection's outgoing queue on behalf of the upload pool.
///
/// Callbacks arrive on whatever thread queued the data. Implementations of
/// `Connection` must invoke them without holding their own queue lock, and
/// must tolerate a listener cancelling itself from inside a callback.
pub trait QueueListener: Send + Sync {
    /// Something was appended to the outgoing queue.
    fn message_queued(&self);

    /// The queue owner wants everything queued sent now.
    fn flush(&self);
}

/// A peer connection as seen by the scheduler.
pub trait Connection: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// Largest single transport write / read the scheduler should request.
    fn mss_size(&self) -> usize;

    fn is_closed(&self) -> bool;

    /// LAN peers may be exempt from group limits.
    fn is_lan_local(&self) -> bool;

    /// Rate groups this connection belongs to, for the given direction.
    fn rate_limiters(&self, direction: Direction) -> Vec<Arc<RateGroup>>;

    /// Probe for readable data. A transport that reports `NotReady` should
    /// keep the waiter and fire it when data arrives.
    fn is_ready_for_read(&self, waiter: &Arc<EventWaiter>) -> Readiness;

    /// Probe for socket writability, with the same waiter contract.
    fn is_ready_for_write(&self, waiter: &Arc<EventWaiter>) -> bool;

    /// Read at most `max_bytes` from the transport into the incoming queue.
    fn receive_from_transport(
        &self,
        max_bytes: usize,
        protocol_is_free: bool,
    ) -> Result<Transferred, TransferError>;

    /// Bytes currently queued for sending.
    fn outgoing_total_size(&self) -> usize;

    /// True if a message that must not wait for a full packet is queued.
    fn has_urgent_message(&self) -> bool;

    /// The outgoing queue asks to be scheduled ahead of normal traffic.
    fn priority_boost(&self) -> bool;

    /// Write at most `max_bytes` of queued data. With `manual_notify` the
    /// queue defers its sent-message listener callbacks until
    /// `do_listener_notifications` is called.
    fn deliver_to_transport(
        &self,
        max_bytes: usize,
        protocol_is_free: bool,
        manual_notify: bool,
    ) -> Result<Transferred, TransferError>;

    /// Fire listener callbacks deferred by a `manual_notify` delivery.
    fn do_listener_notifications(&self);

    fn register_queue_listener(&self, listener: Arc<dyn QueueListener>);

    fn cancel_queue_listener(&self, listener: &Arc<dyn QueueListener>);

    /// Report an I/O failure observed while scheduling this connection.
    fn notify_of_exception(&self, error: TransferError);

    /// Short human-readable label for diagnostics.
    fn describe(&self) -> String {
        format!("conn#{}", self.id())
    }
}

pub type SharedConnection = Arc<dyn Connection>;
