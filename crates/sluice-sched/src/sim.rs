//! In-memory connection.
//!
//! `SimConnection` implements the transport boundary without sockets: an
//! incoming byte counter the scheduler drains, an outgoing queue the
//! scheduler delivers from, readiness flags, and failure injection. The
//! daemon's simulator and the tests both drive it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sluice_core::{
    Connection, ConnectionId, Direction, EventWaiter, QueueListener, RateGroup, Readiness,
    SharedClock, TransferError, Transferred,
};

#[derive(Debug, Default)]
struct Outgoing {
    bytes: usize,
    urgent: bool,
}

pub struct SimConnection {
    id: ConnectionId,
    mss: usize,
    clock: SharedClock,
    closed: AtomicBool,
    lan_local: AtomicBool,
    boost: AtomicBool,
    write_ready: AtomicBool,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    protocol_overhead: AtomicUsize,
    incoming: AtomicUsize,
    last_read_ready_ms: AtomicU64,
    outgoing: Mutex<Outgoing>,
    listeners: Mutex<Vec<Arc<dyn QueueListener>>>,
    groups: Mutex<HashMap<Direction, Vec<Arc<RateGroup>>>>,
    read_waiter: Mutex<Option<Arc<EventWaiter>>>,
    write_waiter: Mutex<Option<Arc<EventWaiter>>>,
    received: AtomicU64,
    sent: AtomicU64,
    deferred_notifications: AtomicUsize,
    notifications: AtomicUsize,
    exceptions: Mutex<Vec<String>>,
}

impl SimConnection {
    pub fn new(id: ConnectionId, mss: usize, clock: SharedClock) -> Arc<Self> {
        let now = clock.now_ms();
        Arc::new(Self {
            id,
            mss,
            clock,
            closed: AtomicBool::new(false),
            lan_local: AtomicBool::new(false),
            boost: AtomicBool::new(false),
            write_ready: AtomicBool::new(true),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            protocol_overhead: AtomicUsize::new(0),
            incoming: AtomicUsize::new(0),
            last_read_ready_ms: AtomicU64::new(now),
            outgoing: Mutex::new(Outgoing::default()),
            listeners: Mutex::new(Vec::new()),
            groups: Mutex::new(HashMap::new()),
            read_waiter: Mutex::new(None),
            write_waiter: Mutex::new(None),
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            deferred_notifications: AtomicUsize::new(0),
            notifications: AtomicUsize::new(0),
            exceptions: Mutex::new(Vec::new()),
        })
    }

    // ── Test / simulator controls ────────────────────────────────────────────

    pub fn set_lan_local(&self, lan: bool) {
        self.lan_local.store(lan, Ordering::Relaxed);
    }

    pub fn set_priority_boost(&self, boost: bool) {
        self.boost.store(boost, Ordering::Relaxed);
    }

    pub fn add_group(&self, direction: Direction, group: Arc<RateGroup>) {
        self.groups.lock().entry(direction).or_default().push(group);
    }

    /// Bytes of each transfer reported as protocol overhead.
    pub fn set_protocol_overhead(&self, bytes: usize) {
        self.protocol_overhead.store(bytes, Ordering::Relaxed);
    }

    pub fn set_write_ready(&self, ready: bool) {
        self.write_ready.store(ready, Ordering::Relaxed);
        if ready {
            fire(&self.write_waiter);
        }
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::Relaxed);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Relaxed);
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    /// Bytes arrive from the peer and wait to be read.
    pub fn feed_incoming(&self, bytes: usize) {
        self.incoming.fetch_add(bytes, Ordering::Relaxed);
        fire(&self.read_waiter);
    }

    pub fn incoming_pending(&self) -> usize {
        self.incoming.load(Ordering::Relaxed)
    }

    /// The application queues `bytes` for sending.
    pub fn queue_outgoing(&self, bytes: usize) {
        self.outgoing.lock().bytes += bytes;
        self.notify_listeners(|l| l.message_queued());
    }

    /// Queue a message that must not wait for a full packet.
    pub fn queue_urgent(&self, bytes: usize) {
        {
            let mut out = self.outgoing.lock();
            out.bytes += bytes;
            out.urgent = true;
        }
        self.notify_listeners(|l| l.message_queued());
    }

    /// The application asks for everything queued to go out now.
    pub fn request_flush(&self) {
        self.notify_listeners(|l| l.flush());
    }

    pub fn bytes_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn exception_count(&self) -> usize {
        self.exceptions.lock().len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Sent-message notifications delivered so far.
    pub fn notifications_fired(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }

    // Listeners run without our locks held; they may call back into us.
    fn notify_listeners(&self, f: impl Fn(&Arc<dyn QueueListener>)) {
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            f(listener);
        }
    }
}

fn fire(slot: &Mutex<Option<Arc<EventWaiter>>>) {
    if let Some(waiter) = slot.lock().take() {
        waiter.event_occurred();
    }
}

fn reset_error() -> TransferError {
    TransferError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionReset,
        "simulated reset",
    ))
}

impl Connection for SimConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn mss_size(&self) -> usize {
        self.mss
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn is_lan_local(&self) -> bool {
        self.lan_local.load(Ordering::Relaxed)
    }

    fn rate_limiters(&self, direction: Direction) -> Vec<Arc<RateGroup>> {
        self.groups
            .lock()
            .get(&direction)
            .cloned()
            .unwrap_or_default()
    }

    fn is_ready_for_read(&self, waiter: &Arc<EventWaiter>) -> Readiness {
        let now = self.clock.now_ms();
        if !self.is_closed() && self.incoming.load(Ordering::Relaxed) > 0 {
            self.last_read_ready_ms.store(now, Ordering::Relaxed);
            return Readiness::Ready;
        }
        *self.read_waiter.lock() = Some(waiter.clone());
        let since = self.last_read_ready_ms.load(Ordering::Relaxed);
        Readiness::NotReady {
            stale_for: Duration::from_millis(now.saturating_sub(since)),
        }
    }

    fn is_ready_for_write(&self, waiter: &Arc<EventWaiter>) -> bool {
        if !self.is_closed() && self.write_ready.load(Ordering::Relaxed) {
            return true;
        }
        *self.write_waiter.lock() = Some(waiter.clone());
        false
    }

    fn receive_from_transport(
        &self,
        max_bytes: usize,
        _protocol_is_free: bool,
    ) -> Result<Transferred, TransferError> {
        if self.is_closed() {
            return Err(TransferError::Closed);
        }
        if self.fail_reads.load(Ordering::Relaxed) {
            return Err(reset_error());
        }
        let mut taken = 0;
        let _ = self
            .incoming
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |pending| {
                taken = pending.min(max_bytes);
                Some(pending - taken)
            });
        self.received.fetch_add(taken as u64, Ordering::Relaxed);
        Ok(split(taken, self.protocol_overhead.load(Ordering::Relaxed)))
    }

    fn outgoing_total_size(&self) -> usize {
        self.outgoing.lock().bytes
    }

    fn has_urgent_message(&self) -> bool {
        self.outgoing.lock().urgent
    }

    fn priority_boost(&self) -> bool {
        self.boost.load(Ordering::Relaxed)
    }

    fn deliver_to_transport(
        &self,
        max_bytes: usize,
        _protocol_is_free: bool,
        manual_notify: bool,
    ) -> Result<Transferred, TransferError> {
        if self.is_closed() {
            return Err(TransferError::Closed);
        }
        if self.fail_writes.load(Ordering::Relaxed) {
            return Err(reset_error());
        }
        let written = {
            let mut out = self.outgoing.lock();
            let n = out.bytes.min(max_bytes);
            out.bytes -= n;
            if out.bytes == 0 {
                out.urgent = false;
            }
            n
        };
        if written > 0 {
            self.sent.fetch_add(written as u64, Ordering::Relaxed);
            if manual_notify {
                self.deferred_notifications.fetch_add(1, Ordering::Relaxed);
            } else {
                self.notifications.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(split(written, self.protocol_overhead.load(Ordering::Relaxed)))
    }

    fn do_listener_notifications(&self) {
        let pending = self.deferred_notifications.swap(0, Ordering::Relaxed);
        self.notifications.fetch_add(pending, Ordering::Relaxed);
    }

    fn register_queue_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners.lock().push(listener);
    }

    fn cancel_queue_listener(&self, listener: &Arc<dyn QueueListener>) {
        self.listeners
            .lock()
            .retain(|l| !std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(listener)));
    }

    fn notify_of_exception(&self, error: TransferError) {
        tracing::debug!(conn = self.id, %error, "simulated connection failed");
        self.exceptions.lock().push(error.to_string());
    }

    fn describe(&self) -> String {
        format!(
            "sim#{} in={} out={}",
            self.id,
            self.incoming_pending(),
            self.outgoing_total_size()
        )
    }
}

fn split(total: usize, overhead: usize) -> Transferred {
    let protocol = overhead.min(total);
    Transferred::new(total - protocol, protocol)
}
