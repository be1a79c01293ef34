//! Shared download pool.
//!
//! Most peers are idle most of the time, so connections are split into an
//! active list (recently readable) and an idle list (not readable for a
//! while). Each pass walks only the active list; the idle list is rescanned
//! at most every `IDLE_CHECK_INTERVAL_MS`.
//!
//! Membership changes arrive from any thread. They update a copy-on-write
//! member list and queue an action; the linked lists themselves are only
//! edited inside `do_processing`, on the read controller's thread.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use sluice_core::{ConnectionId, EventWaiter, Readiness, SharedClock, SharedConnection, TransferError};

use crate::conn_list::{NodeId, Segment, SegmentedList};
use crate::cow::CowList;
use crate::entity::{Priority, RateControlledEntity};
use crate::rate_handler::SharedRateHandler;

/// How often idle connections are probed for readiness.
pub const IDLE_CHECK_INTERVAL_MS: u64 = 500;
/// An active connection unreadable for longer than this goes idle.
pub const MOVE_TO_IDLE_AFTER_MS: u64 = 500;

enum PoolAction {
    Add(SharedConnection),
    Remove(ConnectionId),
}

struct Lists {
    list: SegmentedList<SharedConnection>,
    nodes: HashMap<ConnectionId, NodeId>,
    last_idle_check_ms: u64,
}

pub struct MultiPeerDownloader {
    handler: SharedRateHandler,
    clock: SharedClock,
    members: CowList<SharedConnection>,
    membership: Mutex<()>,
    actions_tx: Sender<PoolAction>,
    actions_rx: Receiver<PoolAction>,
    lists: Mutex<Lists>,
}

impl MultiPeerDownloader {
    pub fn new(handler: SharedRateHandler, clock: SharedClock) -> Self {
        let (actions_tx, actions_rx) = crossbeam_channel::unbounded();
        let now = clock.now_ms();
        Self {
            handler,
            clock,
            members: CowList::new(),
            membership: Mutex::new(()),
            actions_tx,
            actions_rx,
            lists: Mutex::new(Lists {
                list: SegmentedList::new(),
                nodes: HashMap::new(),
                last_idle_check_ms: now,
            }),
        }
    }

    pub fn add_peer_connection(&self, conn: SharedConnection) {
        let _guard = self.membership.lock();
        let id = conn.id();
        if self.members.contains(|c| c.id() == id) {
            tracing::debug!(conn = id, "already in download pool");
            return;
        }
        self.members.push(conn.clone());
        let _ = self.actions_tx.send(PoolAction::Add(conn));
    }

    /// Returns whether the connection was a member.
    pub fn remove_peer_connection(&self, conn: &SharedConnection) -> bool {
        let _guard = self.membership.lock();
        let id = conn.id();
        if !self.members.remove_first(|c| c.id() == id) {
            return false;
        }
        let _ = self.actions_tx.send(PoolAction::Remove(id));
        true
    }

    pub fn members(&self) -> Arc<Vec<SharedConnection>> {
        self.members.snapshot()
    }

    /// (active, idle) list sizes as of the last pass.
    pub fn segment_sizes(&self) -> (usize, usize) {
        let lists = self.lists.lock();
        (lists.list.len(Segment::Active), lists.list.len(Segment::Idle))
    }

    fn apply_pending(&self, lists: &mut Lists) {
        for action in self.actions_rx.try_iter() {
            match action {
                PoolAction::Add(conn) => {
                    let id = conn.id();
                    if !lists.nodes.contains_key(&id) {
                        let node = lists.list.push_head(Segment::Active, conn);
                        lists.nodes.insert(id, node);
                    }
                }
                PoolAction::Remove(id) => {
                    if let Some(node) = lists.nodes.remove(&id) {
                        lists.list.remove(node);
                    }
                }
            }
        }
    }

    fn promote_ready_idle(&self, lists: &mut Lists, waiter: &Arc<EventWaiter>) {
        let now = self.clock.now_ms();
        if now.saturating_sub(lists.last_idle_check_ms) < IDLE_CHECK_INTERVAL_MS {
            return;
        }
        lists.last_idle_check_ms = now;

        let mut cursor = lists.list.head(Segment::Idle);
        while let Some(node) = cursor {
            cursor = lists.list.next(node);
            let ready = lists
                .list
                .get(node)
                .map(|c| c.is_ready_for_read(waiter).is_ready())
                .unwrap_or(false);
            if ready {
                lists.list.move_to_head(node, Segment::Active);
            }
        }
    }
}

impl RateControlledEntity for MultiPeerDownloader {
    fn can_process(&self, _waiter: &Arc<EventWaiter>) -> bool {
        !self.members.is_empty() && self.handler.current_allowance().bytes > 0
    }

    fn do_processing(&self, waiter: &Arc<EventWaiter>, max_bytes: Option<usize>) -> usize {
        let allowance = self.handler.current_allowance();
        let mut remaining = match max_bytes {
            Some(cap) => allowance.bytes.min(cap),
            None => allowance.bytes,
        };

        let mut failures: Vec<(SharedConnection, TransferError)> = Vec::new();
        let mut data_total = 0;
        let mut protocol_total = 0;

        {
            let mut guard = self.lists.lock();
            let lists = &mut *guard;
            self.apply_pending(lists);
            self.promote_ready_idle(lists, waiter);

            // Visit each active node at most once; rotated nodes land behind us.
            let mut cursor = lists.list.head(Segment::Active);
            let mut to_visit = lists.list.len(Segment::Active);

            while remaining > 0 && to_visit > 0 {
                let Some(node) = cursor else { break };
                cursor = lists.list.next(node);
                to_visit -= 1;
                let Some(conn) = lists.list.get(node).cloned() else {
                    continue;
                };

                match conn.is_ready_for_read(waiter) {
                    Readiness::Ready => {
                        let quota = remaining.min(conn.mss_size());
                        match conn.receive_from_transport(quota, allowance.protocol_is_free) {
                            Ok(moved) => {
                                data_total += moved.data_bytes;
                                protocol_total += moved.protocol_bytes;
                                remaining = remaining.saturating_sub(moved.total());
                            }
                            Err(error) => failures.push((conn, error)),
                        }
                        lists.list.move_to_tail(node, Segment::Active);
                    }
                    Readiness::NotReady { stale_for } => {
                        if stale_for.as_millis() as u64 > MOVE_TO_IDLE_AFTER_MS {
                            lists.list.move_to_tail(node, Segment::Idle);
                        }
                    }
                }
            }
        }

        if data_total + protocol_total > 0 {
            self.handler.bytes_processed(data_total, protocol_total);
        }

        for (conn, error) in failures {
            tracing::debug!(conn = conn.id(), %error, "pool read failed");
            conn.notify_of_exception(error);
        }

        data_total + protocol_total
    }

    fn priority(&self) -> Priority {
        Priority::High
    }

    fn rate_handler(&self) -> SharedRateHandler {
        self.handler.clone()
    }

    fn connection_count(&self) -> usize {
        self.members.len()
    }

    fn ready_connection_count(&self, waiter: &Arc<EventWaiter>) -> usize {
        self.members
            .snapshot()
            .iter()
            .filter(|c| c.is_ready_for_read(waiter).is_ready())
            .count()
    }

    fn describe(&self) -> String {
        let (active, idle) = self.segment_sizes();
        let mut out = format!(
            "download pool: {} connections (active {}, idle {})",
            self.members.len(),
            active,
            idle
        );
        for conn in self.members.snapshot().iter() {
            out.push_str("\n  ");
            out.push_str(&conn.describe());
        }
        out
    }
}
