use std::time::Duration;

use sluice_core::Direction;

use crate::*;

#[test]
fn failing_connection_does_not_stall_others() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let (bad, _) = h.connect();
    let (good, _) = h.connect();
    bad.set_fail_reads(true);
    bad.feed_incoming(10_000);
    good.feed_incoming(100_000);

    wait_for(Duration::from_secs(5), || good.bytes_received() == 100_000)?;
    wait_for(Duration::from_secs(5), || bad.exception_count() > 0)
}

#[test]
fn boosted_and_normal_uploaders_both_progress() -> Result<()> {
    let mut h = Harness::start(|c| c.limits.upload_bytes_per_sec = 200_000)?;
    let (boosted, boosted_conn) = h.connect();
    let (normal, normal_conn) = h.connect();
    boosted.set_priority_boost(true);
    h.scheduler
        .upgrade_connection(&boosted_conn, Direction::Upload, None);
    h.scheduler
        .upgrade_connection(&normal_conn, Direction::Upload, None);
    assert_eq!(h.scheduler.write_controller().boosted_count(), 1);

    boosted.queue_outgoing(MSS * 2000);
    normal.queue_outgoing(MSS * 2000);
    wait_for(Duration::from_secs(5), || {
        boosted.bytes_sent() > 0 && normal.bytes_sent() > 0
    })?;
    assert!(!h.scheduler.write_controller().bias_details().is_empty());
    // Stop the write loop so no fallback turn is in flight, then the
    // freeze it takes must have been undone.
    h.scheduler.shutdown();
    assert!(!h
        .scheduler
        .processor(Direction::Upload)
        .main_bucket()
        .is_frozen());
    Ok(())
}

#[test]
fn stats_track_registered_connections() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let (_, a) = h.connect();
    let (_, _b) = h.connect();
    let stats = h.scheduler.stats();
    assert!(stats.running);
    assert_eq!(stats.download.connections, 2);
    assert_eq!(stats.download.pool_connections, 2);

    h.scheduler.deregister_connection(&a);
    assert_eq!(h.scheduler.stats().download.connections, 1);
    Ok(())
}

#[test]
fn closed_connection_is_not_registered() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let conn = h.unregistered();
    conn.close();
    let shared: SharedConnection = conn.clone();
    h.scheduler.register_connection(shared.clone());
    assert!(!h
        .scheduler
        .processor(Direction::Download)
        .is_registered(&shared));
    Ok(())
}
