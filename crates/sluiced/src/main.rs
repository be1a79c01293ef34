//! sluiced — runs the bandwidth scheduler as a daemon.
//!
//! Loads config, starts the read and write loops, optionally drives a set
//! of simulated peers through them, and serves a small HTTP API for stats
//! and runtime limit changes.

use std::sync::Arc;

use anyhow::{Context, Result};

use sluice_core::config::SluiceConfig;
use sluice_core::{LiveSettings, MonotonicClock, RateGroupRegistry};
use sluice_sched::Scheduler;

mod simulation;
mod status;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = SluiceConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = SluiceConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        SluiceConfig::default()
    });
    tracing::info!(
        upload = config.limits.upload_bytes_per_sec,
        download = config.limits.download_bytes_per_sec,
        "sluiced starting"
    );

    let settings = LiveSettings::from_config(&config);
    let groups = RateGroupRegistry::new();
    groups.apply_config(&config.limits.groups);

    let clock = MonotonicClock::shared();
    let scheduler = Arc::new(Scheduler::new(settings, clock.clone()));
    scheduler.start().context("failed to start scheduler")?;

    let simulation = if config.simulation.peers > 0 {
        Some(simulation::Simulation::start(
            scheduler.clone(),
            &groups,
            &config.simulation,
            clock,
        ))
    } else {
        None
    };

    if config.api.port != 0 {
        let state = status::StatusState {
            scheduler: scheduler.clone(),
            groups: groups.clone(),
        };
        let port = config.api.port;
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, port).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    if let Some(sim) = simulation {
        sim.stop();
    }
    // Joining the loop threads blocks.
    tokio::task::spawn_blocking(move || scheduler.shutdown())
        .await
        .context("scheduler shutdown task failed")?;
    Ok(())
}
