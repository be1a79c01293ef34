use std::time::Duration;

use sluice_core::{Direction, RateGroup};
use sluice_sched::ConnectionState;

use crate::*;

#[test]
fn group_limit_binds_upgraded_connection_only() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let (limited, limited_conn) = h.connect();
    let (free, _) = h.connect();

    let group = RateGroup::new("slow", 10_000);
    h.scheduler
        .add_rate_limiter(&limited_conn, Direction::Download, group.clone());
    h.scheduler
        .upgrade_connection(&limited_conn, Direction::Download, Some(1));
    assert_eq!(
        h.scheduler
            .processor(Direction::Download)
            .connection_state(&limited_conn),
        Some(ConnectionState::Upgraded)
    );

    limited.feed_incoming(10 * 1024 * 1024);
    free.feed_incoming(1024 * 1024);
    wait_for(Duration::from_secs(5), || free.bytes_received() == 1024 * 1024)?;

    let got = measure(Duration::from_secs(1), || limited.bytes_received());
    assert!(got <= 10_000 + 12_000 + MSS as u64, "read {got} bytes");
    assert!(group.bytes_used() > 0);
    Ok(())
}

#[test]
fn lan_local_connections_skip_group_limits() -> Result<()> {
    let mut h = Harness::start(|c| c.limits.lan_rate_enabled = true)?;
    let conn = h.unregistered();
    conn.set_lan_local(true);
    conn.add_group(Direction::Download, RateGroup::new("wan", 1_000));
    let shared: SharedConnection = conn.clone();
    h.scheduler.register_connection(shared.clone());
    h.scheduler
        .upgrade_connection(&shared, Direction::Download, None);

    conn.feed_incoming(512 * 1024);
    wait_for(Duration::from_secs(5), || conn.bytes_received() == 512 * 1024)
}

#[test]
fn downgrade_returns_connection_to_pool() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let (conn, shared) = h.connect();
    h.scheduler
        .upgrade_connection(&shared, Direction::Upload, Some(4));
    assert_eq!(h.scheduler.stats().upload.upgraded, 1);
    assert!(h.scheduler.dump().contains("[partition 4]"));

    h.scheduler.downgrade_connection(&shared, Direction::Upload);
    let stats = h.scheduler.stats();
    assert_eq!(stats.upload.upgraded, 0);
    assert_eq!(stats.upload.pool_connections, 1);

    conn.queue_outgoing(MSS * 20);
    wait_for(Duration::from_secs(5), || conn.bytes_sent() == (MSS * 20) as u64)
}

#[test]
fn group_bucket_lives_as_long_as_its_connections() -> Result<()> {
    let mut h = Harness::start(|_| {})?;
    let group = RateGroup::new("shared", 5_000);
    let (_, a) = h.connect();
    let (_, b) = h.connect();
    h.scheduler.add_rate_limiter(&a, Direction::Upload, group.clone());
    h.scheduler.add_rate_limiter(&b, Direction::Upload, group.clone());

    let processor = h.scheduler.processor(Direction::Upload);
    assert_eq!(processor.group_bucket_count(), 1);
    h.scheduler.deregister_connection(&a);
    assert_eq!(processor.group_bucket_count(), 1);
    h.scheduler.remove_rate_limiter(&b, Direction::Upload, &group);
    assert_eq!(processor.group_bucket_count(), 0);
    Ok(())
}
