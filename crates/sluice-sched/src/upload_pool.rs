//! Shared upload pool.
//!
//! Packet-filling round-robin: each ready connection writes at most one
//! MSS-sized chunk per turn, and a connection only gets a turn once it has
//! a full packet queued (or something urgent). Connections with less than
//! that wait in `waiting`, watched by a queue listener, until they fill up,
//! flush, or sit unsent past `FLUSH_WAIT_MS`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use sluice_core::{
    ConnectionId, EventWaiter, QueueListener, SharedClock, SharedConnection, TransferError,
};

use crate::entity::{Priority, RateControlledEntity};
use crate::rate_handler::SharedRateHandler;

/// How often waiting connections are checked for a forced flush.
pub const FLUSH_CHECK_INTERVAL_MS: u64 = 500;
/// Queued data older than this is sent even if it is less than a packet.
pub const FLUSH_WAIT_MS: u64 = 3_000;

struct WaitingPeer {
    conn: SharedConnection,
    listener: Arc<dyn QueueListener>,
    last_message_added_ms: u64,
    bumped: bool,
}

#[derive(Default)]
struct Lists {
    waiting: HashMap<ConnectionId, WaitingPeer>,
    ready: VecDeque<SharedConnection>,
    last_flush_check_ms: u64,
}

impl Lists {
    fn contains(&self, id: ConnectionId) -> bool {
        self.waiting.contains_key(&id) || self.ready.iter().any(|c| c.id() == id)
    }
}

struct Shared {
    clock: SharedClock,
    lists: Mutex<Lists>,
    idle_waiter: Mutex<Option<Arc<EventWaiter>>>,
}

fn has_full_packet(conn: &SharedConnection) -> bool {
    conn.outgoing_total_size() >= conn.mss_size() || conn.has_urgent_message()
}

impl Shared {
    fn add_to_waiting(self: &Arc<Self>, lists: &mut Lists, conn: SharedConnection) {
        let listener: Arc<dyn QueueListener> = Arc::new(PeerQueueListener {
            pool: Arc::downgrade(self),
            conn: conn.id(),
        });
        conn.register_queue_listener(listener.clone());
        lists.waiting.insert(
            conn.id(),
            WaitingPeer {
                conn,
                listener,
                last_message_added_ms: self.clock.now_ms(),
                bumped: false,
            },
        );
    }

    /// Wake the write loop if it parked on this pool.
    fn wake_idle(&self) {
        if let Some(waiter) = self.idle_waiter.lock().take() {
            waiter.event_occurred();
        }
    }

    fn take_from_waiting(lists: &mut Lists, id: ConnectionId) -> Option<SharedConnection> {
        let peer = lists.waiting.remove(&id)?;
        peer.conn.cancel_queue_listener(&peer.listener);
        Some(peer.conn)
    }

    fn flush_check(&self) {
        let now = self.clock.now_ms();
        let mut lists = self.lists.lock();
        let last = lists.last_flush_check_ms;
        if now >= last && now - last <= FLUSH_CHECK_INTERVAL_MS {
            return;
        }

        let mut expired = Vec::new();
        for (id, peer) in lists.waiting.iter_mut() {
            let fresh = now >= peer.last_message_added_ms
                && now - peer.last_message_added_ms <= FLUSH_WAIT_MS;
            if fresh {
                continue;
            }
            if peer.conn.outgoing_total_size() > 0 {
                expired.push(*id);
            } else {
                peer.last_message_added_ms = now;
            }
        }
        for id in expired {
            if let Some(conn) = Self::take_from_waiting(&mut lists, id) {
                tracing::trace!(conn = id, "forced flush");
                lists.ready.push_back(conn);
            }
        }
        lists.last_flush_check_ms = now;
    }
}

/// Moves a waiting connection to ready once it has a full packet.
struct PeerQueueListener {
    pool: Weak<Shared>,
    conn: ConnectionId,
}

impl QueueListener for PeerQueueListener {
    fn message_queued(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let now = pool.clock.now_ms();
        let promoted = {
            let mut lists = pool.lists.lock();
            let Some(peer) = lists.waiting.get_mut(&self.conn) else {
                return;
            };
            if has_full_packet(&peer.conn) {
                match Shared::take_from_waiting(&mut lists, self.conn) {
                    Some(conn) => {
                        lists.ready.push_back(conn);
                        true
                    }
                    None => false,
                }
            } else {
                if !peer.bumped {
                    // Only the first trickle restarts the flush timer.
                    peer.bumped = true;
                    peer.last_message_added_ms = now;
                }
                false
            }
        };
        if promoted {
            pool.wake_idle();
        }
    }

    fn flush(&self) {
        let Some(pool) = self.pool.upgrade() else {
            return;
        };
        let promoted = {
            let mut lists = pool.lists.lock();
            match Shared::take_from_waiting(&mut lists, self.conn) {
                Some(conn) => {
                    lists.ready.push_back(conn);
                    true
                }
                None => false,
            }
        };
        if promoted {
            pool.wake_idle();
        }
    }
}

pub struct MultiPeerUploader {
    handler: SharedRateHandler,
    shared: Arc<Shared>,
}

impl MultiPeerUploader {
    pub fn new(handler: SharedRateHandler, clock: SharedClock) -> Self {
        let now = clock.now_ms();
        Self {
            handler,
            shared: Arc::new(Shared {
                clock,
                lists: Mutex::new(Lists {
                    last_flush_check_ms: now,
                    ..Lists::default()
                }),
                idle_waiter: Mutex::new(None),
            }),
        }
    }

    pub fn add_peer_connection(&self, conn: SharedConnection) {
        {
            let mut lists = self.shared.lists.lock();
            if lists.contains(conn.id()) {
                tracing::debug!(conn = conn.id(), "already in upload pool");
                return;
            }
            if has_full_packet(&conn) {
                lists.ready.push_back(conn);
            } else {
                self.shared.add_to_waiting(&mut lists, conn);
            }
        }
        self.shared.wake_idle();
    }

    /// Returns whether the connection was a member.
    pub fn remove_peer_connection(&self, conn: &SharedConnection) -> bool {
        let mut lists = self.shared.lists.lock();
        let id = conn.id();
        if Shared::take_from_waiting(&mut lists, id).is_some() {
            return true;
        }
        match lists.ready.iter().position(|c| c.id() == id) {
            Some(pos) => {
                lists.ready.remove(pos);
                true
            }
            None => false,
        }
    }

    /// (waiting, ready) list sizes.
    pub fn list_sizes(&self) -> (usize, usize) {
        let lists = self.shared.lists.lock();
        (lists.waiting.len(), lists.ready.len())
    }

    fn write(&self, waiter: &Arc<EventWaiter>, budget: usize, protocol_is_free: bool) -> usize {
        if budget == 0 {
            return 0;
        }

        let mut remaining = budget;
        let mut data_written = 0;
        let mut protocol_written = 0;
        let mut notify: Vec<SharedConnection> = Vec::new();
        let mut failures: Vec<(SharedConnection, TransferError)> = Vec::new();

        {
            let mut lists = self.shared.lists.lock();
            let mut unusable = 0;

            while remaining > 0 && unusable < lists.ready.len() {
                let Some(conn) = lists.ready.pop_front() else { break };

                if !conn.is_ready_for_write(waiter) {
                    lists.ready.push_back(conn);
                    unusable += 1;
                    continue;
                }

                let total = conn.outgoing_total_size();
                if total == 0 {
                    self.shared.add_to_waiting(&mut lists, conn);
                    continue;
                }

                let mss = conn.mss_size();
                let allowed = remaining.min(mss);
                let available = total.min(mss);
                if allowed < available {
                    // Not enough budget for a full packet from this one.
                    lists.ready.push_back(conn);
                    unusable += 1;
                    continue;
                }

                match conn.deliver_to_transport(available, protocol_is_free, true) {
                    Ok(moved) => {
                        data_written += moved.data_bytes;
                        protocol_written += moved.protocol_bytes;
                        let written = moved.total();
                        remaining = remaining.saturating_sub(written);
                        if written > 0 {
                            notify.push(conn.clone());
                        }
                        if has_full_packet(&conn) {
                            lists.ready.push_back(conn);
                            if written > 0 {
                                unusable = 0;
                            } else {
                                unusable += 1;
                            }
                        } else {
                            self.shared.add_to_waiting(&mut lists, conn);
                        }
                    }
                    Err(error) => {
                        failures.push((conn.clone(), error));
                        self.shared.add_to_waiting(&mut lists, conn);
                    }
                }
            }
        }

        for conn in &notify {
            conn.do_listener_notifications();
        }
        for (conn, error) in failures {
            tracing::debug!(conn = conn.id(), %error, "pool write failed");
            conn.notify_of_exception(error);
        }

        let written = data_written + protocol_written;
        if written > 0 {
            self.handler.bytes_processed(data_written, protocol_written);
        }
        written
    }
}

impl RateControlledEntity for MultiPeerUploader {
    fn can_process(&self, waiter: &Arc<EventWaiter>) -> bool {
        self.shared.flush_check();
        {
            let lists = self.shared.lists.lock();
            if lists.ready.is_empty() {
                // Woken by an add or by a waiting connection filling up.
                *self.shared.idle_waiter.lock() = Some(waiter.clone());
                return false;
            }
        }
        self.handler.current_allowance().permits_transfer()
    }

    fn do_processing(&self, waiter: &Arc<EventWaiter>, max_bytes: Option<usize>) -> usize {
        let allowance = self.handler.current_allowance();
        let budget = match max_bytes {
            Some(cap) => allowance.bytes.min(cap),
            None => allowance.bytes,
        };
        self.write(waiter, budget, allowance.protocol_is_free)
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn rate_handler(&self) -> SharedRateHandler {
        self.handler.clone()
    }

    fn bytes_ready_to_write(&self) -> usize {
        let lists = self.shared.lists.lock();
        let waiting: usize = lists
            .waiting
            .values()
            .map(|p| p.conn.outgoing_total_size())
            .sum();
        let ready: usize = lists.ready.iter().map(|c| c.outgoing_total_size()).sum();
        waiting + ready
    }

    fn connection_count(&self) -> usize {
        let lists = self.shared.lists.lock();
        lists.waiting.len() + lists.ready.len()
    }

    fn ready_connection_count(&self, waiter: &Arc<EventWaiter>) -> usize {
        let lists = self.shared.lists.lock();
        lists
            .waiting
            .values()
            .map(|p| &p.conn)
            .chain(lists.ready.iter())
            .filter(|c| c.is_ready_for_write(waiter))
            .count()
    }

    fn describe(&self) -> String {
        let lists = self.shared.lists.lock();
        let mut out = format!(
            "upload pool: {} waiting, {} ready",
            lists.waiting.len(),
            lists.ready.len()
        );
        for peer in lists.waiting.values() {
            out.push_str("\n  waiting ");
            out.push_str(&peer.conn.describe());
        }
        for conn in &lists.ready {
            out.push_str("\n  ready ");
            out.push_str(&conn.describe());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimConnection;
    use crate::test_support::{manual_clock, FixedRateHandler};
    use sluice_core::ManualClock;

    struct Fixture {
        pool: MultiPeerUploader,
        handler: Arc<FixedRateHandler>,
        manual: Arc<ManualClock>,
        clock: SharedClock,
        waiter: Arc<EventWaiter>,
    }

    fn fixture(budget: usize) -> Fixture {
        let handler = FixedRateHandler::new(budget);
        let (manual, clock) = manual_clock();
        Fixture {
            pool: MultiPeerUploader::new(handler.clone(), clock.clone()),
            handler,
            manual,
            clock,
            waiter: Arc::new(EventWaiter::new()),
        }
    }

    #[test]
    fn sub_packet_connection_waits_until_full() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(40);
        f.pool.add_peer_connection(conn.clone());
        assert_eq!(f.pool.list_sizes(), (1, 0));
        assert_eq!(conn.listener_count(), 1);

        conn.queue_outgoing(60);
        assert_eq!(f.pool.list_sizes(), (0, 1));
        assert_eq!(conn.listener_count(), 0);
    }

    #[test]
    fn urgent_message_skips_waiting() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_urgent(5);
        f.pool.add_peer_connection(conn.clone());
        assert_eq!(f.pool.list_sizes(), (0, 1));
        assert_eq!(f.pool.do_processing(&f.waiter, None), 5);
    }

    #[test]
    fn explicit_flush_moves_to_ready() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(10);
        f.pool.add_peer_connection(conn.clone());
        conn.request_flush();
        assert_eq!(f.pool.list_sizes(), (0, 1));
    }

    #[test]
    fn stale_waiting_data_is_force_flushed() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(10);
        f.pool.add_peer_connection(conn.clone());

        f.manual.advance(FLUSH_WAIT_MS);
        assert!(!f.pool.can_process(&f.waiter));
        f.manual.advance(FLUSH_CHECK_INTERVAL_MS + 1);
        assert!(f.pool.can_process(&f.waiter));
        assert_eq!(f.pool.do_processing(&f.waiter, None), 10);
        assert_eq!(conn.bytes_sent(), 10);
    }

    #[test]
    fn only_first_trickle_bumps_flush_timer() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(1);
        f.pool.add_peer_connection(conn.clone());

        f.manual.advance(2_000);
        conn.queue_outgoing(1); // bumps
        f.manual.advance(2_000);
        conn.queue_outgoing(1); // ignored
        f.manual.advance(1_100);
        f.pool.can_process(&f.waiter);
        assert_eq!(f.pool.list_sizes(), (0, 1));
    }

    #[test]
    fn empty_waiting_connection_has_timer_reset() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        f.pool.add_peer_connection(conn.clone());
        f.manual.advance(FLUSH_WAIT_MS + FLUSH_CHECK_INTERVAL_MS + 1);
        f.pool.can_process(&f.waiter);
        assert_eq!(f.pool.list_sizes(), (1, 0));
    }

    #[test]
    fn round_robin_writes_one_packet_per_connection() {
        let f = fixture(300);
        let conns: Vec<_> = (0..3)
            .map(|i| {
                let c = SimConnection::new(i, 100, f.clock.clone());
                c.queue_outgoing(1_000);
                f.pool.add_peer_connection(c.clone());
                c
            })
            .collect();

        assert_eq!(f.pool.do_processing(&f.waiter, None), 300);
        for c in &conns {
            assert_eq!(c.bytes_sent(), 100);
            assert_eq!(c.notifications_fired(), 1);
        }
        assert_eq!(f.handler.charged(), 300);
    }

    #[test]
    fn budget_below_a_packet_writes_nothing() {
        let f = fixture(99);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(1_000);
        f.pool.add_peer_connection(conn.clone());
        assert_eq!(f.pool.do_processing(&f.waiter, None), 0);
        assert_eq!(conn.bytes_sent(), 0);
    }

    #[test]
    fn small_remainder_drains_with_small_budget() {
        let f = fixture(1_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(150);
        f.pool.add_peer_connection(conn.clone());
        assert_eq!(f.pool.do_processing(&f.waiter, None), 100);
        // 50 left: back to waiting until it fills or flushes.
        assert_eq!(f.pool.list_sizes(), (1, 0));
        conn.request_flush();
        f.handler.set(50);
        assert_eq!(f.pool.do_processing(&f.waiter, None), 50);
    }

    #[test]
    fn unwritable_connections_do_not_spin() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(1_000);
        conn.set_write_ready(false);
        f.pool.add_peer_connection(conn.clone());
        assert_eq!(f.pool.do_processing(&f.waiter, None), 0);
        assert_eq!(f.pool.list_sizes(), (0, 1));
    }

    #[test]
    fn write_failure_is_reported_outside_lock() {
        let f = fixture(10_000);
        let bad = SimConnection::new(1, 100, f.clock.clone());
        let good = SimConnection::new(2, 100, f.clock.clone());
        bad.queue_outgoing(500);
        bad.set_fail_writes(true);
        good.queue_outgoing(500);
        f.pool.add_peer_connection(bad.clone());
        f.pool.add_peer_connection(good.clone());

        assert_eq!(f.pool.do_processing(&f.waiter, Some(200)), 200);
        assert_eq!(bad.exception_count(), 1);
        assert_eq!(good.bytes_sent(), 200);
        // The failed connection waits for removal.
        let shared: SharedConnection = bad.clone();
        assert!(f.pool.remove_peer_connection(&shared));
        assert_eq!(bad.listener_count(), 0);
    }

    #[test]
    fn removing_unknown_connection_is_false() {
        let f = fixture(10_000);
        let conn: SharedConnection = SimConnection::new(1, 100, f.clock.clone());
        assert!(!f.pool.remove_peer_connection(&conn));
    }

    #[test]
    fn adding_to_empty_pool_wakes_idle_waiter() {
        let f = fixture(10_000);
        assert!(!f.pool.can_process(&f.waiter));
        let conn = SimConnection::new(1, 100, f.clock.clone());
        f.pool.add_peer_connection(conn);
        assert!(f.waiter.wait_for_event(std::time::Duration::from_millis(0)));
    }

    #[test]
    fn filling_a_waiting_connection_wakes_idle_waiter() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(40);
        f.pool.add_peer_connection(conn.clone());
        assert!(!f.pool.can_process(&f.waiter));
        assert!(!f.waiter.wait_for_event(std::time::Duration::from_millis(0)));

        conn.queue_outgoing(60);
        assert!(f.waiter.wait_for_event(std::time::Duration::from_millis(0)));
        assert!(f.pool.can_process(&f.waiter));
    }

    #[test]
    fn flushing_a_waiting_connection_wakes_idle_waiter() {
        let f = fixture(10_000);
        let conn = SimConnection::new(1, 100, f.clock.clone());
        conn.queue_outgoing(10);
        f.pool.add_peer_connection(conn.clone());
        assert!(!f.pool.can_process(&f.waiter));

        conn.request_flush();
        assert!(f.waiter.wait_for_event(std::time::Duration::from_millis(0)));
    }

    #[test]
    fn bytes_ready_counts_both_lists() {
        let f = fixture(10_000);
        let a = SimConnection::new(1, 100, f.clock.clone());
        let b = SimConnection::new(2, 100, f.clock.clone());
        a.queue_outgoing(30);
        b.queue_outgoing(300);
        f.pool.add_peer_connection(a);
        f.pool.add_peer_connection(b);
        assert_eq!(f.pool.bytes_ready_to_write(), 330);
        assert_eq!(f.pool.connection_count(), 2);
    }
}
