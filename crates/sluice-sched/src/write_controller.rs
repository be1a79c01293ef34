//! Write controller.
//!
//! Same loop shape as the read side, with a third `boosted` class for
//! dedicated uploaders whose connection asks for priority boost. Boosted
//! entities are polled ahead of normal ones, but a rolling "gift" of bytes
//! is handed to normal entities first so a few boosted peers cannot starve
//! everybody else. When no boosted entity can progress, the normal entity
//! that gets the turn runs with the upload main bucket frozen.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use sluice_core::{Direction, EventWaiter, LiveSettings, SharedClock};

use crate::average::MovingAverage;
use crate::controller::{
    any_connections, collect_stats, dump_list, list_contains, next_ready, panic_message,
    remove_from, ControllerStats, EntityList, LoopCounters, Registered,
};
use crate::diag::{format_bytes, IndentWriter};
use crate::entity::{EntityController, Priority, SharedEntity};
use crate::transfer::TransferProcessor;

/// How often the boosted/normal split is re-evaluated.
pub const BOOST_RECHECK_INTERVAL_MS: u64 = 5_000;
/// Booster statistics are sampled at most this often.
pub const BOOSTER_SAMPLE_INTERVAL_MS: u64 = 1_000;
const BOOSTER_SLOTS: usize = 5;

enum WriteOutcome {
    Progress(usize),
    NoProgress,
    NoneReady,
}

struct LoopState {
    next_normal: usize,
    next_boosted: usize,
    next_high: usize,
    check_high_first: bool,
    aggressive_np_normal: usize,
    aggressive_np_high: usize,
    last_boost_check_ms: Option<u64>,
}

/// Booster bookkeeping: one slot per second over a five second window.
struct Booster {
    gifts: [u64; BOOSTER_SLOTS],
    normal_writes: [u64; BOOSTER_SLOTS],
    stat_index: usize,
    last_sample_ms: Option<u64>,
    normal_written: u64,
    boost_written: u64,
    boost_rate: MovingAverage,
    normal_rate: MovingAverage,
    boost_avail: MovingAverage,
    normal_avail: MovingAverage,
    boost_data: MovingAverage,
    normal_data: MovingAverage,
}

impl Booster {
    fn new() -> Self {
        Self {
            gifts: [0; BOOSTER_SLOTS],
            normal_writes: [0; BOOSTER_SLOTS],
            stat_index: 0,
            last_sample_ms: None,
            normal_written: 0,
            boost_written: 0,
            boost_rate: MovingAverage::new(BOOSTER_SLOTS),
            normal_rate: MovingAverage::new(BOOSTER_SLOTS),
            boost_avail: MovingAverage::new(BOOSTER_SLOTS),
            normal_avail: MovingAverage::new(BOOSTER_SLOTS),
            boost_data: MovingAverage::new(BOOSTER_SLOTS),
            normal_data: MovingAverage::new(BOOSTER_SLOTS),
        }
    }

    fn sample_due(&mut self, now_ms: u64) -> bool {
        match self.last_sample_ms {
            Some(last) if now_ms.saturating_sub(last) < BOOSTER_SAMPLE_INTERVAL_MS => false,
            _ => {
                self.last_sample_ms = Some(now_ms);
                true
            }
        }
    }

    /// Bytes normal entities may still take this window on top of their share.
    fn effective_gift(&self) -> u64 {
        let gifts = self.gifts.iter().fold(0u64, |acc, g| acc.saturating_add(*g));
        let normal = self
            .normal_writes
            .iter()
            .fold(self.normal_written, |acc, n| acc.saturating_add(*n));
        gifts.saturating_sub(normal)
    }

    /// Take `used` out of the gift slots, oldest first.
    fn consume_gift(&mut self, mut used: u64) {
        for i in self.stat_index..self.stat_index + BOOSTER_SLOTS {
            if used == 0 {
                break;
            }
            let slot = &mut self.gifts[i % BOOSTER_SLOTS];
            let take = (*slot).min(used);
            *slot -= take;
            used -= take;
        }
    }
}

/// Undoes a main bucket freeze on drop.
struct FreezeGuard(Option<Arc<TransferProcessor>>);

impl FreezeGuard {
    fn freeze(processor: Option<Arc<TransferProcessor>>) -> Self {
        if let Some(p) = &processor {
            p.set_rate_limiter_freeze_state(true);
        }
        Self(processor)
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if let Some(p) = &self.0 {
            p.set_rate_limiter_freeze_state(false);
        }
    }
}

pub struct WriteController {
    settings: Arc<LiveSettings>,
    clock: SharedClock,
    waiter: Arc<EventWaiter>,
    normal: EntityList,
    boosted: EntityList,
    high: EntityList,
    writers: Mutex<()>,
    loop_state: Mutex<LoopState>,
    booster: Mutex<Booster>,
    counters: LoopCounters,
    upload_processor: OnceLock<Weak<TransferProcessor>>,
}

impl WriteController {
    pub fn new(settings: Arc<LiveSettings>, clock: SharedClock) -> Self {
        Self {
            settings,
            clock,
            waiter: Arc::new(EventWaiter::new()),
            normal: EntityList::new(),
            boosted: EntityList::new(),
            high: EntityList::new(),
            writers: Mutex::new(()),
            loop_state: Mutex::new(LoopState {
                next_normal: 0,
                next_boosted: 0,
                next_high: 0,
                check_high_first: true,
                aggressive_np_normal: 0,
                aggressive_np_high: 0,
                last_boost_check_ms: None,
            }),
            booster: Mutex::new(Booster::new()),
            counters: LoopCounters::default(),
            upload_processor: OnceLock::new(),
        }
    }

    /// The processor whose main bucket is frozen while normal entities use
    /// bandwidth boosted ones left idle. Only the first binding sticks.
    pub fn bind_upload_processor(&self, processor: &Arc<TransferProcessor>) {
        if self.upload_processor.set(Arc::downgrade(processor)).is_err() {
            tracing::warn!("upload processor already bound to write controller");
        }
    }

    pub fn waiter(&self) -> &Arc<EventWaiter> {
        &self.waiter
    }

    pub fn process_once(&self) -> bool {
        let now = self.clock.now_ms();
        let busy = {
            let mut state = self.loop_state.lock();
            let high_first = state.check_high_first;
            state.check_high_first = !high_first;
            if high_first {
                self.do_high_write(&mut state) || self.do_normal_write(&mut state, now)
            } else {
                self.do_normal_write(&mut state, now) || self.do_high_write(&mut state)
            }
        };
        self.recheck_boosts(now);
        busy
    }

    pub fn run_loop(&self, stop: &AtomicBool) {
        tracing::info!("write controller started");
        while !stop.load(Ordering::Acquire) {
            let busy = match catch_unwind(AssertUnwindSafe(|| self.process_once())) {
                Ok(busy) => busy,
                Err(payload) => {
                    tracing::error!(panic = %panic_message(&*payload), "write loop iteration panicked");
                    false
                }
            };
            if !busy {
                let timeout = if any_connections(&[&self.high, &self.boosted, &self.normal]) {
                    self.settings.idle_sleep(Direction::Upload)
                } else {
                    self.settings.no_connection_sleep()
                };
                self.counters.waited();
                self.waiter.wait_for_event(timeout);
            }
        }
        tracing::info!("write controller stopped");
    }

    fn do_high_write(&self, state: &mut LoopState) -> bool {
        let Some(entity) = next_ready(&self.high.snapshot(), &mut state.next_high, &self.waiter)
        else {
            return false;
        };
        if entity.do_processing(&self.waiter, None) > 0 {
            self.counters.progressed();
            return true;
        }
        self.counters.stalled();
        if self.settings.aggressive(Direction::Upload) {
            state.aggressive_np_high += 1;
            if state.aggressive_np_high < self.high.len() {
                return true;
            }
            state.aggressive_np_high = 0;
        }
        false
    }

    fn do_normal_write(&self, state: &mut LoopState, now: u64) -> bool {
        match self.process_next_normal(state, now) {
            WriteOutcome::Progress(_) => {
                self.counters.progressed();
                true
            }
            WriteOutcome::NoProgress => {
                self.counters.stalled();
                if self.settings.aggressive(Direction::Upload) {
                    state.aggressive_np_normal += 1;
                    if state.aggressive_np_normal < self.normal.len() + self.boosted.len() {
                        return true;
                    }
                    state.aggressive_np_normal = 0;
                }
                false
            }
            WriteOutcome::NoneReady => false,
        }
    }

    fn process_next_normal(&self, state: &mut LoopState, now: u64) -> WriteOutcome {
        let normal = self.normal.snapshot();
        let boosted = self.boosted.snapshot();
        let mut booster = self.booster.lock();

        let mut do_boosting = !boosted.is_empty();
        if do_boosting && booster.sample_due(now) {
            self.sample_booster(&mut booster, &normal, &boosted);
        }

        if do_boosting && booster.boost_data.is_zero() {
            // Nothing queued for boosted peers: turn one over and move on.
            if state.next_boosted >= boosted.len() {
                state.next_boosted = 0;
            }
            let entity = &boosted[state.next_boosted].entity;
            state.next_boosted += 1;
            if entity.can_process(&self.waiter) {
                booster.boost_written += entity.do_processing(&self.waiter, None) as u64;
            }
            do_boosting = false;
        }

        let _freeze = if do_boosting {
            self.spend_gift(state, &mut booster, &normal);

            let mut cursor = state.next_boosted;
            let ready = boosted.len();
            for _ in 0..ready {
                if cursor >= boosted.len() {
                    cursor = 0;
                }
                let entity = &boosted[cursor].entity;
                cursor += 1;
                if !entity.can_process(&self.waiter) {
                    continue;
                }
                let written = entity.do_processing(&self.waiter, None);
                if written > 0 {
                    booster.boost_written += written as u64;
                    state.next_boosted = cursor;
                    return WriteOutcome::Progress(written);
                }
            }
            state.next_boosted = cursor;

            Some(FreezeGuard::freeze(
                self.upload_processor.get().and_then(Weak::upgrade),
            ))
        } else {
            booster.normal_written = 0;
            booster.boost_written = 0;
            None
        };

        match next_ready(&normal, &mut state.next_normal, &self.waiter) {
            Some(entity) => {
                let written = entity.do_processing(&self.waiter, None);
                if written > 0 {
                    booster.normal_written += written as u64;
                    WriteOutcome::Progress(written)
                } else {
                    WriteOutcome::NoProgress
                }
            }
            None => WriteOutcome::NoneReady,
        }
    }

    fn sample_booster(&self, booster: &mut Booster, normal: &[Registered], boosted: &[Registered]) {
        let slot = booster.stat_index;
        booster.gifts[slot] = self.settings.booster_gift_bytes();
        booster.normal_writes[slot] = booster.normal_written;
        booster.stat_index = (slot + 1) % BOOSTER_SLOTS;

        let (boost_written, normal_written) = (booster.boost_written, booster.normal_written);
        booster.boost_rate.update(boost_written);
        booster.normal_rate.update(normal_written);
        booster.normal_written = 0;
        booster.boost_written = 0;

        let (data, avail) = self.queued_and_allowed(normal);
        booster.normal_data.update(data);
        booster.normal_avail.update(avail);
        let (data, avail) = self.queued_and_allowed(boosted);
        booster.boost_data.update(data);
        booster.boost_avail.update(avail);
    }

    /// Total queued bytes and the largest allowance over the ready entities.
    fn queued_and_allowed(&self, list: &[Registered]) -> (u64, u64) {
        let mut data = 0u64;
        let mut max_allowed = 0u64;
        for r in list {
            if r.entity.can_process(&self.waiter) {
                data += r.entity.bytes_ready_to_write() as u64;
                max_allowed = max_allowed.max(r.entity.rate_handler().current_allowance().bytes as u64);
            }
        }
        (data, max_allowed)
    }

    fn spend_gift(&self, state: &mut LoopState, booster: &mut Booster, normal: &[Registered]) {
        let gift = booster.effective_gift();
        if gift == 0 {
            return;
        }
        let mut remaining = gift;
        for _ in 0..normal.len() {
            if remaining == 0 {
                break;
            }
            if state.next_normal >= normal.len() {
                state.next_normal = 0;
            }
            let entity = &normal[state.next_normal].entity;
            state.next_normal += 1;
            if entity.can_process(&self.waiter) {
                let cap = usize::try_from(remaining).unwrap_or(usize::MAX);
                let used = (entity.do_processing(&self.waiter, Some(cap)) as u64).min(remaining);
                booster.normal_written += used;
                remaining -= used;
            }
        }
        booster.consume_gift(gift - remaining);
    }

    /// Move entities between `normal` and `boosted` when their wish changed.
    fn recheck_boosts(&self, now: u64) {
        {
            let mut state = self.loop_state.lock();
            match state.last_boost_check_ms {
                None => {
                    state.last_boost_check_ms = Some(now);
                    return;
                }
                Some(last) if now.saturating_sub(last) <= BOOST_RECHECK_INTERVAL_MS => return,
                Some(_) => state.last_boost_check_ms = Some(now),
            }
        }

        let changed = self.normal.contains(|r| r.entity.priority_boost())
            || self.boosted.contains(|r| !r.entity.priority_boost());
        if !changed {
            return;
        }

        let _writer = self.writers.lock();
        let (mut new_boosted, mut new_normal) = (Vec::new(), Vec::new());
        for r in self.normal.snapshot().iter().chain(self.boosted.snapshot().iter()) {
            if r.entity.priority_boost() {
                new_boosted.push(r.clone());
            } else {
                new_normal.push(r.clone());
            }
        }
        tracing::debug!(
            normal = new_normal.len(),
            boosted = new_boosted.len(),
            "rebalanced boosted uploaders"
        );
        self.normal.update(|items| *items = new_normal);
        self.boosted.update(|items| *items = new_boosted);
    }

    /// One-line summary of the booster averages, empty when nothing is boosted.
    pub fn bias_details(&self) -> String {
        if self.boosted.is_empty() {
            return String::new();
        }
        let b = self.booster.lock();
        format!(
            "n={},{}/s,{}/s;b={},{}/s,{}/s;h={}",
            format_bytes(b.normal_data.average()),
            format_bytes(b.normal_rate.average()),
            format_bytes(b.normal_avail.average()),
            format_bytes(b.boost_data.average()),
            format_bytes(b.boost_rate.average()),
            format_bytes(b.boost_avail.average()),
            self.high.len()
        )
    }

    pub fn stats(&self) -> ControllerStats {
        collect_stats(
            &self.counters,
            &[&self.normal, &self.boosted, &self.high],
            &self.waiter,
            true,
        )
    }

    pub fn generate(&self, w: &mut IndentWriter) {
        w.println("Write Controller");
        w.indent();
        dump_list(w, "normal", &self.normal);
        dump_list(w, "boosted", &self.boosted);
        dump_list(w, "priority", &self.high);
        w.exdent();
    }

    pub fn boosted_count(&self) -> usize {
        self.boosted.len()
    }

    pub fn contains(&self, entity: &SharedEntity) -> bool {
        [&self.normal, &self.boosted, &self.high]
            .into_iter()
            .any(|l| list_contains(l, entity))
    }
}

impl EntityController for WriteController {
    fn add_entity(&self, entity: SharedEntity, partition_id: Option<u32>) {
        {
            let _writer = self.writers.lock();
            let list = match entity.priority() {
                Priority::High => &self.high,
                Priority::Normal if entity.priority_boost() => &self.boosted,
                Priority::Normal => &self.normal,
            };
            list.push(Registered {
                entity,
                partition_id,
            });
        }
        self.waiter.event_occurred();
    }

    fn remove_entity(&self, entity: &SharedEntity) -> bool {
        let _writer = self.writers.lock();
        let found = match entity.priority() {
            Priority::High => remove_from(&self.high, entity),
            Priority::Normal => {
                remove_from(&self.boosted, entity) || remove_from(&self.normal, entity)
            }
        };
        if !found {
            tracing::warn!(entity = %entity.describe(), "write entity not found");
        }
        found
    }

    fn entity_count(&self) -> usize {
        self.normal.len() + self.boosted.len() + self.high.len()
    }
}
