//! Sluice integration test harness.
//!
//! These tests run the real scheduler threads against in-memory
//! connections and measure what gets through over wall-clock time, so
//! the byte bounds they assert are deliberately loose.
//!
//!   cargo test --test integration

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use sluice_core::config::SluiceConfig;
use sluice_core::{LiveSettings, MonotonicClock, SharedConnection};
use sluice_sched::{Scheduler, SimConnection};

mod controllers;
mod limits;
mod upgrade;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const MSS: usize = 1460;

/// A running scheduler; threads stop on drop.
pub struct Harness {
    pub scheduler: Arc<Scheduler>,
    next_id: u64,
}

impl Harness {
    /// Start a scheduler with `tweak` applied to the default config.
    pub fn start(tweak: impl FnOnce(&mut SluiceConfig)) -> Result<Self> {
        let mut config = SluiceConfig::default();
        config.scheduler.read_idle_sleep_ms = 5;
        config.scheduler.write_idle_sleep_ms = 5;
        config.scheduler.no_connection_sleep_ms = 20;
        tweak(&mut config);
        let scheduler = Arc::new(Scheduler::new(
            LiveSettings::from_config(&config),
            MonotonicClock::shared(),
        ));
        scheduler.start()?;
        Ok(Self { scheduler, next_id: 1 })
    }

    /// A new connection, registered in both directions.
    pub fn connect(&mut self) -> (Arc<SimConnection>, SharedConnection) {
        let conn = self.unregistered();
        let shared: SharedConnection = conn.clone();
        self.scheduler.register_connection(shared.clone());
        (conn, shared)
    }

    pub fn unregistered(&mut self) -> Arc<SimConnection> {
        let id = self.next_id;
        self.next_id += 1;
        SimConnection::new(id, MSS, MonotonicClock::shared())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Poll `cond` every few ms until it holds or `timeout` passes.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    bail!("condition not met within {timeout:?}")
}

/// Bytes moved by `read` across `window`.
pub fn measure(window: Duration, read: impl Fn() -> u64) -> u64 {
    let start = read();
    std::thread::sleep(window);
    read() - start
}
