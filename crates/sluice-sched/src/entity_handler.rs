//! Entity handler: one per direction.
//!
//! Owns the direction's shared pool and the dedicated entities of upgraded
//! connections, and keeps the controller's entity list in step with both.
//! All mutations go through one mutex.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_core::{ConnectionId, Direction, SharedClock, SharedConnection};

use crate::download_pool::MultiPeerDownloader;
use crate::entity::{EntityController, SharedEntity};
use crate::rate_handler::SharedRateHandler;
use crate::single::{SinglePeerDownloader, SinglePeerUploader};
use crate::upload_pool::MultiPeerUploader;

enum Pool {
    Upload(Arc<MultiPeerUploader>),
    Download(Arc<MultiPeerDownloader>),
}

impl Pool {
    fn entity(&self) -> SharedEntity {
        match self {
            Pool::Upload(p) => p.clone(),
            Pool::Download(p) => p.clone(),
        }
    }

    fn add(&self, conn: SharedConnection) {
        match self {
            Pool::Upload(p) => p.add_peer_connection(conn),
            Pool::Download(p) => p.add_peer_connection(conn),
        }
    }

    fn remove(&self, conn: &SharedConnection) -> bool {
        match self {
            Pool::Upload(p) => p.remove_peer_connection(conn),
            Pool::Download(p) => p.remove_peer_connection(conn),
        }
    }
}

#[derive(Default)]
struct HandlerState {
    pool_registered: bool,
    upgraded: HashMap<ConnectionId, SharedEntity>,
}

pub struct EntityHandler {
    direction: Direction,
    pool: Pool,
    main_handler: SharedRateHandler,
    controller: Arc<dyn EntityController>,
    state: Mutex<HandlerState>,
}

impl EntityHandler {
    pub fn new(
        direction: Direction,
        main_handler: SharedRateHandler,
        controller: Arc<dyn EntityController>,
        clock: SharedClock,
    ) -> Self {
        let pool = match direction {
            Direction::Upload => {
                Pool::Upload(Arc::new(MultiPeerUploader::new(main_handler.clone(), clock)))
            }
            Direction::Download => {
                Pool::Download(Arc::new(MultiPeerDownloader::new(main_handler.clone(), clock)))
            }
        };
        Self {
            direction,
            pool,
            main_handler,
            controller,
            state: Mutex::new(HandlerState::default()),
        }
    }

    /// Put a connection into the shared pool, registering the pool with the
    /// controller the first time.
    pub fn register_peer_connection(&self, conn: SharedConnection) {
        let mut state = self.state.lock();
        if !state.pool_registered {
            self.controller.add_entity(self.pool.entity(), None);
            state.pool_registered = true;
        }
        self.pool.add(conn);
    }

    /// Remove a connection from the pool or its dedicated entity.
    pub fn cancel_peer_connection(&self, conn: &SharedConnection) -> bool {
        let mut state = self.state.lock();
        if self.pool.remove(conn) {
            return true;
        }
        match state.upgraded.remove(&conn.id()) {
            Some(entity) => {
                if !self.controller.remove_entity(&entity) {
                    tracing::warn!(conn = conn.id(), direction = %self.direction, "dedicated entity was not registered");
                }
                true
            }
            None => false,
        }
    }

    pub fn upgrade_peer_connection(
        &self,
        conn: SharedConnection,
        handler: SharedRateHandler,
        partition_id: Option<u32>,
    ) {
        let mut state = self.state.lock();
        let id = conn.id();
        if state.upgraded.contains_key(&id) {
            tracing::debug!(conn = id, direction = %self.direction, "already upgraded");
            return;
        }
        self.pool.remove(&conn);
        let entity: SharedEntity = match self.direction {
            Direction::Upload => Arc::new(SinglePeerUploader::new(conn, handler)),
            Direction::Download => Arc::new(SinglePeerDownloader::new(conn, handler)),
        };
        state.upgraded.insert(id, entity.clone());
        self.controller.add_entity(entity, partition_id);
        tracing::debug!(conn = id, direction = %self.direction, ?partition_id, "connection upgraded");
    }

    pub fn downgrade_peer_connection(&self, conn: &SharedConnection) {
        let mut state = self.state.lock();
        let Some(entity) = state.upgraded.remove(&conn.id()) else {
            tracing::debug!(conn = conn.id(), direction = %self.direction, "not upgraded");
            return;
        };
        self.controller.remove_entity(&entity);
        self.pool.add(conn.clone());
        tracing::debug!(conn = conn.id(), direction = %self.direction, "connection downgraded");
    }

    /// The dedicated handler if upgraded, the pool's otherwise.
    pub fn rate_handler(&self, conn: &SharedConnection) -> SharedRateHandler {
        let state = self.state.lock();
        match state.upgraded.get(&conn.id()) {
            Some(entity) => entity.rate_handler(),
            None => self.main_handler.clone(),
        }
    }

    pub fn pool_entity(&self) -> SharedEntity {
        self.pool.entity()
    }

    pub fn pool_connection_count(&self) -> usize {
        self.pool.entity().connection_count()
    }

    pub fn upgraded_count(&self) -> usize {
        self.state.lock().upgraded.len()
    }

    pub fn is_upgraded(&self, conn: &SharedConnection) -> bool {
        self.state.lock().upgraded.contains_key(&conn.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimConnection;
    use crate::test_support::{manual_clock, FixedRateHandler, RecordingController};

    fn handler(direction: Direction) -> (EntityHandler, Arc<RecordingController>, SharedClock) {
        let (_, clock) = manual_clock();
        let controller = Arc::new(RecordingController::default());
        let handler = EntityHandler::new(
            direction,
            FixedRateHandler::new(10_000),
            controller.clone(),
            clock.clone(),
        );
        (handler, controller, clock)
    }

    #[test]
    fn pool_is_registered_once() {
        let (h, controller, clock) = handler(Direction::Download);
        h.register_peer_connection(SimConnection::new(1, 100, clock.clone()));
        h.register_peer_connection(SimConnection::new(2, 100, clock));
        assert_eq!(controller.entity_count(), 1);
        assert_eq!(h.pool_connection_count(), 2);
    }

    #[test]
    fn upgrade_moves_connection_out_of_pool() {
        let (h, controller, clock) = handler(Direction::Upload);
        let a: SharedConnection = SimConnection::new(1, 100, clock.clone());
        let b: SharedConnection = SimConnection::new(2, 100, clock);
        h.register_peer_connection(a.clone());
        h.register_peer_connection(b);
        let pool_before = h.pool_connection_count();
        let entities_before = controller.entity_count();

        h.upgrade_peer_connection(a.clone(), FixedRateHandler::new(5), Some(7));

        assert_eq!(h.pool_connection_count(), pool_before - 1);
        assert_eq!(controller.entity_count(), entities_before + 1);
        assert_eq!(controller.entities.lock().last().map(|(_, p)| *p), Some(Some(7)));
        assert_eq!(h.rate_handler(&a).current_allowance().bytes, 5);
    }

    #[test]
    fn upgrade_and_downgrade_are_idempotent() {
        let (h, controller, clock) = handler(Direction::Download);
        let conn: SharedConnection = SimConnection::new(1, 100, clock);
        h.register_peer_connection(conn.clone());

        h.upgrade_peer_connection(conn.clone(), FixedRateHandler::new(1), None);
        h.upgrade_peer_connection(conn.clone(), FixedRateHandler::new(1), None);
        assert_eq!(controller.entity_count(), 2);
        assert_eq!(h.upgraded_count(), 1);

        h.downgrade_peer_connection(&conn);
        h.downgrade_peer_connection(&conn);
        assert_eq!(controller.entity_count(), 1);
        assert_eq!(h.pool_connection_count(), 1);
        assert_eq!(h.rate_handler(&conn).current_allowance().bytes, 10_000);
    }

    #[test]
    fn cancel_finds_pool_or_dedicated() {
        let (h, controller, clock) = handler(Direction::Upload);
        let pooled: SharedConnection = SimConnection::new(1, 100, clock.clone());
        let upgraded: SharedConnection = SimConnection::new(2, 100, clock.clone());
        let stranger: SharedConnection = SimConnection::new(3, 100, clock);
        h.register_peer_connection(pooled.clone());
        h.register_peer_connection(upgraded.clone());
        h.upgrade_peer_connection(upgraded.clone(), FixedRateHandler::new(1), None);

        assert!(h.cancel_peer_connection(&pooled));
        assert!(h.cancel_peer_connection(&upgraded));
        assert!(!h.cancel_peer_connection(&stranger));
        // Only the pool entity is left registered.
        assert_eq!(controller.entity_count(), 1);
        assert_eq!(h.upgraded_count(), 0);
    }
}
