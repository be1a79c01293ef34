//! Transfer processor: one per direction.
//!
//! Binds the direction's main bucket to the connections registered for it,
//! keeps a refcounted bucket per rate group (created when the first
//! connection references the group, dropped with the last), and moves
//! connections between the shared pool and dedicated entities.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sluice_core::{
    ConnectionId, Direction, GroupId, LiveSettings, RateGroup, SharedClock, SharedConnection,
};

use crate::bucket::ByteBucket;
use crate::entity::EntityController;
use crate::entity_handler::EntityHandler;
use crate::rate_handler::{
    GroupBinding, MainRateHandler, SharedBindings, SharedRateHandler, UpgradedRateHandler,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Normal,
    Upgraded,
}

struct ConnectionData {
    connection: SharedConnection,
    state: ConnectionState,
    bindings: SharedBindings,
}

struct GroupData {
    bucket: Arc<ByteBucket>,
    group_size: usize,
}

#[derive(Default)]
struct ProcessorState {
    connections: HashMap<ConnectionId, ConnectionData>,
    group_buckets: HashMap<GroupId, GroupData>,
}

pub struct TransferProcessor {
    direction: Direction,
    settings: Arc<LiveSettings>,
    clock: SharedClock,
    main_bucket: Arc<ByteBucket>,
    main_handler: SharedRateHandler,
    entity_handler: EntityHandler,
    state: Mutex<ProcessorState>,
}

impl TransferProcessor {
    pub fn new(
        direction: Direction,
        settings: Arc<LiveSettings>,
        clock: SharedClock,
        controller: Arc<dyn EntityController>,
    ) -> Self {
        let main_bucket = Arc::new(ByteBucket::new(
            settings.global_limit(direction).effective_rate(),
            clock.clone(),
            settings.min_mss(),
        ));
        let main_handler: SharedRateHandler = Arc::new(MainRateHandler::new(
            direction,
            settings.clone(),
            main_bucket.clone(),
        ));
        let entity_handler =
            EntityHandler::new(direction, main_handler.clone(), controller, clock.clone());
        Self {
            direction,
            settings,
            clock,
            main_bucket,
            main_handler,
            entity_handler,
            state: Mutex::new(ProcessorState::default()),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn register_peer_connection(&self, conn: SharedConnection) {
        let id = conn.id();
        if conn.is_closed() {
            tracing::debug!(conn = id, direction = %self.direction, "not registering closed connection");
            return;
        }
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.connections.contains_key(&id) {
                tracing::warn!(conn = id, direction = %self.direction, "connection already registered");
                return;
            }

            let mut bindings: Vec<GroupBinding> = Vec::new();
            for group in conn.rate_limiters(self.direction) {
                if bindings.iter().any(|b| b.group.id() == group.id()) {
                    continue;
                }
                let bucket = self.acquire_group(&mut state.group_buckets, &group);
                bindings.push(GroupBinding { group, bucket });
            }

            state.connections.insert(
                id,
                ConnectionData {
                    connection: conn.clone(),
                    state: ConnectionState::Normal,
                    bindings: Arc::new(RwLock::new(bindings)),
                },
            );
        }
        self.entity_handler.register_peer_connection(conn);
    }

    /// Returns whether the connection was scheduled anywhere.
    pub fn deregister_peer_connection(&self, conn: &SharedConnection) -> bool {
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(data) = state.connections.remove(&conn.id()) {
                for binding in data.bindings.read().iter() {
                    release_group(&mut state.group_buckets, &binding.group);
                }
            }
        }
        self.entity_handler.cancel_peer_connection(conn)
    }

    /// Move a registered connection to its own entity, limited by its groups.
    pub fn upgrade_peer_connection(&self, conn: &SharedConnection, partition_id: Option<u32>) {
        let id = conn.id();
        if conn.is_closed() {
            tracing::debug!(conn = id, direction = %self.direction, "not upgrading closed connection");
            return;
        }
        let handler: SharedRateHandler = {
            let mut state = self.state.lock();
            let Some(data) = state.connections.get_mut(&id) else {
                tracing::debug!(conn = id, direction = %self.direction, "upgrade of unregistered connection");
                return;
            };
            if data.state != ConnectionState::Normal {
                return;
            }
            data.state = ConnectionState::Upgraded;
            Arc::new(UpgradedRateHandler::new(
                self.direction,
                self.settings.clone(),
                self.main_bucket.clone(),
                data.connection.clone(),
                data.bindings.clone(),
            ))
        };
        self.entity_handler
            .upgrade_peer_connection(conn.clone(), handler, partition_id);
    }

    pub fn downgrade_peer_connection(&self, conn: &SharedConnection) {
        {
            let mut state = self.state.lock();
            let Some(data) = state.connections.get_mut(&conn.id()) else {
                return;
            };
            if data.state != ConnectionState::Upgraded {
                return;
            }
            data.state = ConnectionState::Normal;
        }
        self.entity_handler.downgrade_peer_connection(conn);
    }

    /// Attach an extra group to a registered connection. Effective on the
    /// next tick, including for an already-upgraded connection.
    pub fn add_rate_limiter(&self, conn: &SharedConnection, group: Arc<RateGroup>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(data) = state.connections.get(&conn.id()) else {
            tracing::debug!(conn = conn.id(), group = group.name(), "limiter for unregistered connection");
            return;
        };
        if data.bindings.read().iter().any(|b| b.group.id() == group.id()) {
            return;
        }
        let bucket = self.acquire_group(&mut state.group_buckets, &group);
        data.bindings.write().push(GroupBinding { group, bucket });
    }

    pub fn remove_rate_limiter(&self, conn: &SharedConnection, group: &Arc<RateGroup>) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(data) = state.connections.get(&conn.id()) else {
            return;
        };
        let removed = {
            let mut bindings = data.bindings.write();
            match bindings.iter().position(|b| b.group.id() == group.id()) {
                Some(pos) => {
                    bindings.remove(pos);
                    true
                }
                None => false,
            }
        };
        if removed {
            release_group(&mut state.group_buckets, group);
        }
    }

    pub fn set_rate_limiter_freeze_state(&self, frozen: bool) {
        self.main_bucket.set_frozen(frozen);
    }

    pub fn main_rate_handler(&self) -> SharedRateHandler {
        self.main_handler.clone()
    }

    pub fn rate_handler(&self, conn: &SharedConnection) -> SharedRateHandler {
        self.entity_handler.rate_handler(conn)
    }

    pub fn main_bucket(&self) -> &Arc<ByteBucket> {
        &self.main_bucket
    }

    pub fn connections(&self) -> Vec<SharedConnection> {
        self.state
            .lock()
            .connections
            .values()
            .map(|d| d.connection.clone())
            .collect()
    }

    pub fn is_registered(&self, conn: &SharedConnection) -> bool {
        self.state.lock().connections.contains_key(&conn.id())
    }

    pub fn connection_state(&self, conn: &SharedConnection) -> Option<ConnectionState> {
        self.state.lock().connections.get(&conn.id()).map(|d| d.state)
    }

    pub fn group_bucket_count(&self) -> usize {
        self.state.lock().group_buckets.len()
    }

    pub fn group_bucket(&self, group: GroupId) -> Option<Arc<ByteBucket>> {
        self.state
            .lock()
            .group_buckets
            .get(&group)
            .map(|g| g.bucket.clone())
    }

    pub fn entity_handler(&self) -> &EntityHandler {
        &self.entity_handler
    }

    fn acquire_group(
        &self,
        groups: &mut HashMap<GroupId, GroupData>,
        group: &Arc<RateGroup>,
    ) -> Arc<ByteBucket> {
        let data = groups.entry(group.id()).or_insert_with(|| {
            tracing::debug!(group = group.name(), direction = %self.direction, "group bucket created");
            GroupData {
                bucket: Arc::new(ByteBucket::new(
                    group.effective_rate(),
                    self.clock.clone(),
                    self.settings.min_mss(),
                )),
                group_size: 0,
            }
        });
        data.group_size += 1;
        data.bucket.clone()
    }
}

fn release_group(groups: &mut HashMap<GroupId, GroupData>, group: &Arc<RateGroup>) {
    let Some(data) = groups.get_mut(&group.id()) else {
        return;
    };
    if data.group_size <= 1 {
        groups.remove(&group.id());
        tracing::debug!(group = group.name(), "group bucket dropped");
    } else {
        data.group_size -= 1;
    }
}
