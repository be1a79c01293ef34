//! Rate handlers: how many bytes an entity may move this tick.
//!
//! Two flavours:
//!   MainRateHandler:     the direction's main bucket only. Used by the
//!                        shared pools; pool connections are never
//!                        group-limited.
//!   UpgradedRateHandler: main bucket minus one packet of headroom for the
//!                        pool, then the tightest of the connection's group
//!                        buckets. The group list is re-read on every call,
//!                        so limiters added or removed after the upgrade
//!                        apply on the next tick.
//!
//! Both re-sync bucket rates from the live limits before reading, so a
//! changed limit takes effect on the next tick without any notification.

use std::sync::Arc;

use parking_lot::RwLock;
use sluice_core::{Direction, LiveSettings, RateGroup, SharedConnection};

use crate::bucket::ByteBucket;

/// Bytes an entity may move now, and whether protocol overhead is exempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allowance {
    pub bytes: usize,
    pub protocol_is_free: bool,
}

impl Allowance {
    /// Whether anything at all may be sent or received.
    pub fn permits_transfer(&self) -> bool {
        self.bytes > 0 || self.protocol_is_free
    }
}

pub trait RateHandler: Send + Sync {
    fn current_allowance(&self) -> Allowance;

    /// Charge a completed transfer against the buckets.
    fn bytes_processed(&self, data_bytes: usize, protocol_bytes: usize);
}

pub type SharedRateHandler = Arc<dyn RateHandler>;

/// A rate group attached to a connection together with its bucket.
/// Pairing them in one entry keeps groups and buckets in lockstep.
#[derive(Clone)]
pub struct GroupBinding {
    pub group: Arc<RateGroup>,
    pub bucket: Arc<ByteBucket>,
}

/// A connection's live group list, shared with its upgraded handler.
pub type SharedBindings = Arc<RwLock<Vec<GroupBinding>>>;

fn charged_bytes(
    settings: &LiveSettings,
    direction: Direction,
    data_bytes: usize,
    protocol_bytes: usize,
) -> usize {
    if settings.includes_protocol(direction) {
        data_bytes + protocol_bytes
    } else {
        data_bytes
    }
}

fn sync_main(settings: &LiveSettings, direction: Direction, bucket: &ByteBucket) {
    bucket.sync(
        settings.global_limit(direction).effective_rate(),
        settings.min_mss(),
    );
}

pub struct MainRateHandler {
    direction: Direction,
    settings: Arc<LiveSettings>,
    bucket: Arc<ByteBucket>,
}

impl MainRateHandler {
    pub fn new(direction: Direction, settings: Arc<LiveSettings>, bucket: Arc<ByteBucket>) -> Self {
        Self {
            direction,
            settings,
            bucket,
        }
    }
}

impl RateHandler for MainRateHandler {
    fn current_allowance(&self) -> Allowance {
        sync_main(&self.settings, self.direction, &self.bucket);
        Allowance {
            bytes: self.bucket.available(),
            protocol_is_free: !self.settings.includes_protocol(self.direction),
        }
    }

    fn bytes_processed(&self, data_bytes: usize, protocol_bytes: usize) {
        let charged = charged_bytes(&self.settings, self.direction, data_bytes, protocol_bytes);
        self.bucket.set_bytes_used(charged);
        self.settings
            .global_limit(self.direction)
            .update_bytes_used(charged);
    }
}

pub struct UpgradedRateHandler {
    direction: Direction,
    settings: Arc<LiveSettings>,
    main: Arc<ByteBucket>,
    connection: SharedConnection,
    bindings: SharedBindings,
}

impl UpgradedRateHandler {
    pub fn new(
        direction: Direction,
        settings: Arc<LiveSettings>,
        main: Arc<ByteBucket>,
        connection: SharedConnection,
        bindings: SharedBindings,
    ) -> Self {
        Self {
            direction,
            settings,
            main,
            connection,
            bindings,
        }
    }

    fn group_limited(&self) -> bool {
        LiveSettings::RATE_LIMIT_LAN_TOO
            || !(self.connection.is_lan_local() && self.settings.lan_rate_enabled())
    }
}

impl RateHandler for UpgradedRateHandler {
    fn current_allowance(&self) -> Allowance {
        sync_main(&self.settings, self.direction, &self.main);

        // Leave one packet in the main bucket for the shared pool.
        let mut allowed = self
            .main
            .available()
            .saturating_sub(self.connection.mss_size());

        if self.group_limited() {
            for binding in self.bindings.read().iter() {
                binding
                    .bucket
                    .sync(binding.group.effective_rate(), self.settings.min_mss());
                allowed = allowed.min(binding.bucket.available());
            }
        }

        Allowance {
            bytes: allowed,
            protocol_is_free: !self.settings.includes_protocol(self.direction),
        }
    }

    fn bytes_processed(&self, data_bytes: usize, protocol_bytes: usize) {
        let charged = charged_bytes(&self.settings, self.direction, data_bytes, protocol_bytes);

        if self.group_limited() {
            for binding in self.bindings.read().iter() {
                binding.bucket.set_bytes_used(charged);
                binding.group.update_bytes_used(charged);
            }
        }

        self.main.set_bytes_used(charged);
        self.settings
            .global_limit(self.direction)
            .update_bytes_used(charged);
    }
}
