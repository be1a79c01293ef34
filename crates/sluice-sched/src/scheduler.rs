//! Scheduler: the outward face of the crate.
//!
//! Owns the two controllers, one transfer processor per direction and the
//! loop threads. Everything the network layer needs goes through here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::Serialize;
use sluice_core::{Direction, LiveSettings, RateGroup, SharedClock, SharedConnection};

use crate::controller::ControllerStats;
use crate::diag::IndentWriter;
use crate::error::SchedulerError;
use crate::rate_handler::SharedRateHandler;
use crate::read_controller::ReadController;
use crate::transfer::TransferProcessor;
use crate::write_controller::WriteController;

/// Per-direction counters for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DirectionStats {
    pub limit_bytes_per_sec: i64,
    pub connections: usize,
    pub upgraded: usize,
    pub pool_connections: usize,
    pub group_buckets: usize,
    pub controller: ControllerStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub running: bool,
    pub upload: DirectionStats,
    pub download: DirectionStats,
    pub bias: String,
}

pub struct Scheduler {
    settings: Arc<LiveSettings>,
    read_controller: Arc<ReadController>,
    write_controller: Arc<WriteController>,
    upload: Arc<TransferProcessor>,
    download: Arc<TransferProcessor>,
    stop: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(settings: Arc<LiveSettings>, clock: SharedClock) -> Self {
        let read_controller = Arc::new(ReadController::new(settings.clone()));
        let write_controller = Arc::new(WriteController::new(settings.clone(), clock.clone()));
        let upload = Arc::new(TransferProcessor::new(
            Direction::Upload,
            settings.clone(),
            clock.clone(),
            write_controller.clone(),
        ));
        let download = Arc::new(TransferProcessor::new(
            Direction::Download,
            settings.clone(),
            clock,
            read_controller.clone(),
        ));
        write_controller.bind_upload_processor(&upload);
        Self {
            settings,
            read_controller,
            write_controller,
            upload,
            download,
            stop: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the read and write loop threads.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return Err(SchedulerError::AlreadyStarted);
        }
        self.stop.store(false, Ordering::Release);

        let reader = self.read_controller.clone();
        let stop = self.stop.clone();
        threads.push(
            std::thread::Builder::new()
                .name("sluice-read".into())
                .spawn(move || reader.run_loop(&stop))
                .map_err(SchedulerError::ThreadSpawn)?,
        );

        let writer = self.write_controller.clone();
        let stop = self.stop.clone();
        match std::thread::Builder::new()
            .name("sluice-write".into())
            .spawn(move || writer.run_loop(&stop))
        {
            Ok(handle) => threads.push(handle),
            Err(e) => {
                drop(threads);
                self.shutdown();
                return Err(SchedulerError::ThreadSpawn(e));
            }
        }
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Stop both loops and wait for the threads. Safe to call twice.
    pub fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.threads.lock());
        if handles.is_empty() {
            return;
        }
        self.stop.store(true, Ordering::Release);
        self.read_controller.waiter().event_occurred();
        self.write_controller.waiter().event_occurred();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked during shutdown");
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.threads.lock().is_empty()
    }

    pub fn settings(&self) -> &Arc<LiveSettings> {
        &self.settings
    }

    pub fn processor(&self, direction: Direction) -> &Arc<TransferProcessor> {
        match direction {
            Direction::Upload => &self.upload,
            Direction::Download => &self.download,
        }
    }

    pub fn read_controller(&self) -> &Arc<ReadController> {
        &self.read_controller
    }

    pub fn write_controller(&self) -> &Arc<WriteController> {
        &self.write_controller
    }

    /// Schedule a connection in both directions.
    pub fn register_connection(&self, conn: SharedConnection) {
        self.upload.register_peer_connection(conn.clone());
        self.download.register_peer_connection(conn);
    }

    pub fn deregister_connection(&self, conn: &SharedConnection) {
        let up = self.upload.deregister_peer_connection(conn);
        let down = self.download.deregister_peer_connection(conn);
        if !up && !down {
            tracing::debug!(conn = conn.id(), "deregister of unknown connection");
        }
    }

    pub fn upgrade_connection(
        &self,
        conn: &SharedConnection,
        direction: Direction,
        partition_id: Option<u32>,
    ) {
        self.processor(direction)
            .upgrade_peer_connection(conn, partition_id);
    }

    pub fn downgrade_connection(&self, conn: &SharedConnection, direction: Direction) {
        self.processor(direction).downgrade_peer_connection(conn);
    }

    pub fn add_rate_limiter(
        &self,
        conn: &SharedConnection,
        direction: Direction,
        group: Arc<RateGroup>,
    ) {
        self.processor(direction).add_rate_limiter(conn, group);
    }

    pub fn remove_rate_limiter(
        &self,
        conn: &SharedConnection,
        direction: Direction,
        group: &Arc<RateGroup>,
    ) {
        self.processor(direction).remove_rate_limiter(conn, group);
    }

    pub fn rate_handler(&self, conn: &SharedConnection, direction: Direction) -> SharedRateHandler {
        self.processor(direction).rate_handler(conn)
    }

    pub fn set_rate_limiter_freeze_state(&self, direction: Direction, frozen: bool) {
        self.processor(direction)
            .set_rate_limiter_freeze_state(frozen);
    }

    /// Human-readable dump of every scheduled entity.
    pub fn dump(&self) -> String {
        let mut w = IndentWriter::new();
        self.read_controller.generate(&mut w);
        self.write_controller.generate(&mut w);
        let bias = self.write_controller.bias_details();
        if !bias.is_empty() {
            w.println(format!("Bias: {bias}"));
        }
        w.finish()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            running: self.is_running(),
            upload: self.direction_stats(Direction::Upload, self.write_controller.stats()),
            download: self.direction_stats(Direction::Download, self.read_controller.stats()),
            bias: self.write_controller.bias_details(),
        }
    }

    fn direction_stats(&self, direction: Direction, controller: ControllerStats) -> DirectionStats {
        let processor = self.processor(direction);
        let handler = processor.entity_handler();
        DirectionStats {
            limit_bytes_per_sec: self.settings.global_limit(direction).limit(),
            connections: processor.connections().len(),
            upgraded: handler.upgraded_count(),
            pool_connections: handler.pool_connection_count(),
            group_buckets: processor.group_bucket_count(),
            controller,
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
