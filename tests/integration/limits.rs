use std::time::Duration;

use sluice_core::Direction;

use crate::*;

#[test]
fn unlimited_scheduler_drains_everything() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let (conn, _) = h.connect();
    conn.feed_incoming(2 * 1024 * 1024);
    conn.queue_outgoing(MSS * 1000);
    wait_for(Duration::from_secs(5), || {
        conn.bytes_received() == 2 * 1024 * 1024 && conn.bytes_sent() == (MSS * 1000) as u64
    })
}

#[test]
fn global_download_limit_caps_throughput() -> Result<()> {
    let mut h = Harness::start(|c| c.limits.download_bytes_per_sec = 20_000)?;
    let (conn, _) = h.connect();
    conn.feed_incoming(10 * 1024 * 1024);

    let got = conn.bytes_received();
    std::thread::sleep(Duration::from_secs(1));
    let got = conn.bytes_received() - got;
    // One second of refill plus at most the initial burst.
    assert!(got <= 20_000 + 24_000 + MSS as u64, "read {got} bytes");
    assert!(got >= 10_000, "read only {got} bytes");
    Ok(())
}

#[test]
fn disabled_direction_moves_nothing() -> Result<()> {
    let mut h = Harness::start(|c| c.limits.upload_bytes_per_sec = -1)?;
    let (conn, _) = h.connect();
    conn.queue_outgoing(MSS * 10);
    conn.feed_incoming(10_000);

    wait_for(Duration::from_secs(5), || conn.bytes_received() == 10_000)?;
    assert_eq!(conn.bytes_sent(), 0);
    Ok(())
}

#[test]
fn limit_change_takes_effect_while_running() -> Result<()> {
    let mut h = Harness::start(|c| c.limits.upload_bytes_per_sec = -1)?;
    let (conn, _) = h.connect();
    conn.queue_outgoing(MSS * 100);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(conn.bytes_sent(), 0);

    h.scheduler
        .settings()
        .set_global_limit(Direction::Upload, 0);
    wait_for(Duration::from_secs(5), || {
        conn.bytes_sent() == (MSS * 100) as u64
    })
}

#[test]
fn shared_limit_is_split_between_pooled_connections() -> Result<()> {
    let mut h = Harness::start(|c| c.limits.download_bytes_per_sec = 50_000)?;
    let (a, _) = h.connect();
    let (b, _) = h.connect();
    a.feed_incoming(10 * 1024 * 1024);
    b.feed_incoming(10 * 1024 * 1024);

    let total = measure(Duration::from_secs(1), || a.bytes_received() + b.bytes_received());
    assert!(total <= 50_000 + 60_000 + 2 * MSS as u64, "read {total} bytes");
    assert!(a.bytes_received() > 0 && b.bytes_received() > 0);
    Ok(())
}
