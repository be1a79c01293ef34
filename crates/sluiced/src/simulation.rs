//! Simulated peers.
//!
//! Each peer is an in-memory connection whose link is topped up on a timer
//! in both directions, so the scheduler always has work and the configured
//! limits decide what actually moves. Throughput is logged every few seconds.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use sluice_core::config::SimulationConfig;
use sluice_core::{
    Connection, Direction, RateGroupRegistry, SharedClock, SharedConnection,
};
use sluice_sched::{Scheduler, SimConnection};

const TICK: Duration = Duration::from_millis(100);
const TICKS_PER_REPORT: u64 = 50;

pub struct Simulation {
    scheduler: Arc<Scheduler>,
    peers:     Vec<Arc<SimConnection>>,
    feeder:    JoinHandle<()>,
}

impl Simulation {
    pub fn start(
        scheduler: Arc<Scheduler>,
        groups: &RateGroupRegistry,
        config: &SimulationConfig,
        clock: SharedClock,
    ) -> Self {
        let peers: Vec<_> = (0..config.peers)
            .map(|i| SimConnection::new(u64::from(i) + 1, config.mss, clock.clone()))
            .collect();

        for (i, peer) in peers.iter().enumerate() {
            let conn: SharedConnection = peer.clone();
            scheduler.register_connection(conn.clone());
            if let Some(name) = &config.group {
                for direction in [Direction::Upload, Direction::Download] {
                    scheduler.add_rate_limiter(&conn, direction, groups.get_or_create(name, direction));
                }
            }
            if (i as u32) < config.upgraded {
                for direction in [Direction::Upload, Direction::Download] {
                    scheduler.upgrade_connection(&conn, direction, Some(i as u32));
                }
            }
        }
        tracing::info!(
            peers = config.peers,
            upgraded = config.upgraded.min(config.peers),
            group = config.group.as_deref().unwrap_or("-"),
            "simulation started"
        );

        let feeder = tokio::spawn(feed(peers.clone(), config.link_bytes_per_sec));
        Self { scheduler, peers, feeder }
    }

    pub fn stop(self) {
        self.feeder.abort();
        for peer in &self.peers {
            let conn: SharedConnection = peer.clone();
            self.scheduler.deregister_connection(&conn);
        }
        tracing::info!(peers = self.peers.len(), "simulation stopped");
    }
}

/// Keep about one second of link capacity queued each way.
async fn feed(peers: Vec<Arc<SimConnection>>, link_bytes_per_sec: u64) {
    let per_tick = (link_bytes_per_sec / (1000 / TICK.as_millis() as u64)).max(1) as usize;
    let high_water = link_bytes_per_sec as usize;
    let mut interval = tokio::time::interval(TICK);
    let mut ticks = 0u64;
    let (mut last_rx, mut last_tx) = totals(&peers);

    loop {
        interval.tick().await;
        for peer in &peers {
            if peer.incoming_pending() < high_water {
                peer.feed_incoming(per_tick);
            }
            if peer.outgoing_total_size() < high_water {
                peer.queue_outgoing(per_tick);
            }
        }

        ticks += 1;
        if ticks % TICKS_PER_REPORT == 0 {
            let (rx, tx) = totals(&peers);
            let secs = (TICKS_PER_REPORT * TICK.as_millis() as u64) / 1000;
            tracing::info!(
                down_bytes_per_sec = (rx - last_rx) / secs,
                up_bytes_per_sec = (tx - last_tx) / secs,
                "simulated throughput"
            );
            (last_rx, last_tx) = (rx, tx);
        }
    }
}

fn totals(peers: &[Arc<SimConnection>]) -> (u64, u64) {
    peers.iter().fold((0, 0), |(rx, tx), p| {
        (rx + p.bytes_received(), tx + p.bytes_sent())
    })
}
