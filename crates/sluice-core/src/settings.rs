//! Live scheduler settings.
//!
//! Loaded once from `SluiceConfig`, then read by the scheduler threads on
//! every tick. Anything here can be changed at runtime through `apply` or
//! the individual setters; readers see the new value on their next pass.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SluiceConfig;
use crate::limits::RateGroup;
use crate::transport::Direction;

#[derive(Debug)]
pub struct LiveSettings {
    upload_limit: Arc<RateGroup>,
    download_limit: Arc<RateGroup>,
    up_includes_protocol: AtomicBool,
    down_includes_protocol: AtomicBool,
    lan_rate_enabled: AtomicBool,
    read_idle_sleep_ms: AtomicU64,
    write_idle_sleep_ms: AtomicU64,
    no_connection_sleep_ms: AtomicU64,
    aggressive_read: AtomicBool,
    aggressive_write: AtomicBool,
    booster_gift_bytes: AtomicU64,
    min_mss: AtomicUsize,
}

impl LiveSettings {
    /// When false, LAN-local connections skip their group limits whenever
    /// `lan_rate_enabled` is set. The global limit applies either way.
    pub const RATE_LIMIT_LAN_TOO: bool = false;

    pub fn from_config(config: &SluiceConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn new(config: &SluiceConfig) -> Self {
        let settings = Self {
            upload_limit: RateGroup::new("global/upload", config.limits.upload_bytes_per_sec),
            download_limit: RateGroup::new(
                "global/download",
                config.limits.download_bytes_per_sec,
            ),
            up_includes_protocol: AtomicBool::new(false),
            down_includes_protocol: AtomicBool::new(false),
            lan_rate_enabled: AtomicBool::new(true),
            read_idle_sleep_ms: AtomicU64::new(0),
            write_idle_sleep_ms: AtomicU64::new(0),
            no_connection_sleep_ms: AtomicU64::new(0),
            aggressive_read: AtomicBool::new(false),
            aggressive_write: AtomicBool::new(false),
            booster_gift_bytes: AtomicU64::new(0),
            min_mss: AtomicUsize::new(0),
        };
        settings.apply(config);
        settings
    }

    /// Push a (re)loaded config into the live values.
    pub fn apply(&self, config: &SluiceConfig) {
        let limits = &config.limits;
        let sched = &config.scheduler;
        self.upload_limit.set_limit(limits.upload_bytes_per_sec);
        self.download_limit.set_limit(limits.download_bytes_per_sec);
        self.up_includes_protocol
            .store(limits.up_includes_protocol, Ordering::Relaxed);
        self.down_includes_protocol
            .store(limits.down_includes_protocol, Ordering::Relaxed);
        self.lan_rate_enabled
            .store(limits.lan_rate_enabled, Ordering::Relaxed);
        self.read_idle_sleep_ms
            .store(sched.read_idle_sleep_ms, Ordering::Relaxed);
        self.write_idle_sleep_ms
            .store(sched.write_idle_sleep_ms, Ordering::Relaxed);
        self.no_connection_sleep_ms
            .store(sched.no_connection_sleep_ms, Ordering::Relaxed);
        self.aggressive_read
            .store(sched.aggressive_read, Ordering::Relaxed);
        self.aggressive_write
            .store(sched.aggressive_write, Ordering::Relaxed);
        self.booster_gift_bytes
            .store(sched.booster_gift_kib.saturating_mul(1024), Ordering::Relaxed);
        self.min_mss.store(sched.min_mss.max(1), Ordering::Relaxed);
        tracing::debug!(
            upload = limits.upload_bytes_per_sec,
            download = limits.download_bytes_per_sec,
            "live settings applied"
        );
    }

    /// The global limit for one direction.
    pub fn global_limit(&self, direction: Direction) -> &Arc<RateGroup> {
        match direction {
            Direction::Upload => &self.upload_limit,
            Direction::Download => &self.download_limit,
        }
    }

    pub fn set_global_limit(&self, direction: Direction, limit: i64) {
        self.global_limit(direction).set_limit(limit);
        tracing::info!(%direction, limit, "global limit changed");
    }

    /// Whether protocol overhead is charged against limits in this direction.
    pub fn includes_protocol(&self, direction: Direction) -> bool {
        match direction {
            Direction::Upload => self.up_includes_protocol.load(Ordering::Relaxed),
            Direction::Download => self.down_includes_protocol.load(Ordering::Relaxed),
        }
    }

    pub fn set_includes_protocol(&self, direction: Direction, value: bool) {
        match direction {
            Direction::Upload => self.up_includes_protocol.store(value, Ordering::Relaxed),
            Direction::Download => self.down_includes_protocol.store(value, Ordering::Relaxed),
        }
    }

    /// When set, LAN-local connections skip their group limits.
    pub fn lan_rate_enabled(&self) -> bool {
        self.lan_rate_enabled.load(Ordering::Relaxed)
    }

    pub fn set_lan_rate_enabled(&self, value: bool) {
        self.lan_rate_enabled.store(value, Ordering::Relaxed);
    }

    /// Sleep after a no-progress pass while connections exist.
    pub fn idle_sleep(&self, direction: Direction) -> Duration {
        let ms = match direction {
            Direction::Upload => self.write_idle_sleep_ms.load(Ordering::Relaxed),
            Direction::Download => self.read_idle_sleep_ms.load(Ordering::Relaxed),
        };
        Duration::from_millis(ms)
    }

    pub fn no_connection_sleep(&self) -> Duration {
        Duration::from_millis(self.no_connection_sleep_ms.load(Ordering::Relaxed))
    }

    pub fn aggressive(&self, direction: Direction) -> bool {
        match direction {
            Direction::Upload => self.aggressive_write.load(Ordering::Relaxed),
            Direction::Download => self.aggressive_read.load(Ordering::Relaxed),
        }
    }

    pub fn set_aggressive(&self, direction: Direction, value: bool) {
        match direction {
            Direction::Upload => self.aggressive_write.store(value, Ordering::Relaxed),
            Direction::Download => self.aggressive_read.store(value, Ordering::Relaxed),
        }
    }

    /// Upload bytes per second lent to normal entities while boosting.
    pub fn booster_gift_bytes(&self) -> u64 {
        self.booster_gift_bytes.load(Ordering::Relaxed)
    }

    pub fn min_mss(&self) -> usize {
        self.min_mss.load(Ordering::Relaxed)
    }
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self::new(&SluiceConfig::default())
    }
}
