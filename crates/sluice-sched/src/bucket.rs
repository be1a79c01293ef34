//! Byte bucket: token bucket measured in bytes.
//!
//! The bucket refills lazily on read: `rate` bytes per second, capped at
//! `burst`. Consumption can push the balance below zero; the debt is kept
//! and paid off by later refills, while callers only ever see `max(0, ..)`.
//!
//! A rate at or above `UNLIMITED_RATE` skips refill arithmetic and always
//! reports a full bucket; a rate of 0 reports nothing. A frozen bucket does
//! not refill at all; the time spent frozen is credited on the first read
//! after unfreezing.
//!
//! The clock is read under the state lock so refills are applied in time
//! order across threads.

use parking_lot::Mutex;
use sluice_core::{SharedClock, UNLIMITED_RATE};

#[derive(Debug)]
struct BucketState {
    rate: u64,
    burst: u64,
    available: i64,
    last_refill_ms: u64,
    /// Sub-byte refill carried between reads, in byte-milliseconds.
    carry: u64,
    frozen: bool,
    /// Burst floor, so one packet always fits.
    min_mss: usize,
}

#[derive(Debug)]
pub struct ByteBucket {
    state: Mutex<BucketState>,
    clock: SharedClock,
}

/// Default burst for a rate: 20% headroom over one second's worth.
pub fn default_burst(rate: u64) -> u64 {
    rate.saturating_add(rate / 5)
}

impl ByteBucket {
    /// A full bucket at `rate` bytes/sec with the default burst.
    pub fn new(rate: u64, clock: SharedClock, min_mss: usize) -> Self {
        Self::with_burst(rate, default_burst(rate), clock, min_mss)
    }

    pub fn with_burst(rate: u64, burst: u64, clock: SharedClock, min_mss: usize) -> Self {
        let burst = clamp_burst(rate, burst, min_mss);
        let now = clock.now_ms();
        Self {
            state: Mutex::new(BucketState {
                rate,
                burst,
                available: to_i64(burst),
                last_refill_ms: now,
                carry: 0,
                frozen: false,
                min_mss,
            }),
            clock,
        }
    }

    pub fn rate(&self) -> u64 {
        self.state.lock().rate
    }

    pub fn burst(&self) -> u64 {
        self.state.lock().burst
    }

    /// Change the rate, resetting burst to the default for the new rate.
    pub fn set_rate(&self, rate: u64) {
        self.set_rate_and_burst(rate, default_burst(rate));
    }

    pub fn set_rate_and_burst(&self, rate: u64, burst: u64) {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        retune(&mut state, now, rate, burst);
    }

    /// Re-sync to the live `rate` and `min_mss`, resetting burst to the
    /// default. The common case, nothing changed, is a no-op.
    pub fn sync(&self, rate: u64, min_mss: usize) {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        if state.rate == rate && state.min_mss == min_mss {
            return;
        }
        state.min_mss = min_mss;
        retune(&mut state, now, rate, default_burst(rate));
    }

    /// Bytes that may be consumed right now. Never negative.
    pub fn available(&self) -> usize {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        refill(&mut state, now);
        state.available.max(0) as usize
    }

    /// The true balance, including any debt.
    pub fn balance(&self) -> i64 {
        let mut state = self.state.lock();
        let now = self.clock.now_ms();
        refill(&mut state, now);
        state.available
    }

    /// Debit `bytes`. The balance may go negative.
    pub fn set_bytes_used(&self, bytes: usize) {
        let mut state = self.state.lock();
        state.available = state.available.saturating_sub(to_i64(bytes as u64));
    }

    pub fn set_frozen(&self, frozen: bool) {
        self.state.lock().frozen = frozen;
    }

    pub fn is_frozen(&self) -> bool {
        self.state.lock().frozen
    }
}

fn clamp_burst(rate: u64, burst: u64, min_mss: usize) -> u64 {
    burst.max(rate).max(min_mss as u64)
}

fn to_i64(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

fn retune(state: &mut BucketState, now: u64, rate: u64, burst: u64) {
    // Settle the old rate before switching.
    refill(state, now);
    state.rate = rate;
    state.burst = clamp_burst(rate, burst, state.min_mss);
    state.carry = 0;
    let cap = to_i64(state.burst);
    if state.available > cap {
        state.available = cap;
    }
}

fn refill(state: &mut BucketState, now: u64) {
    if state.frozen {
        return;
    }
    if now < state.last_refill_ms {
        // Clock went backwards; restart the interval from here.
        state.last_refill_ms = now;
        return;
    }
    if state.rate == 0 {
        // Disabled: nothing accrues and any stored burst is withheld.
        state.available = state.available.min(0);
        state.last_refill_ms = now;
        state.carry = 0;
        return;
    }
    if state.rate >= UNLIMITED_RATE {
        state.available = to_i64(state.burst);
        state.last_refill_ms = now;
        state.carry = 0;
        return;
    }
    let burst = to_i64(state.burst);
    if state.available >= burst {
        state.last_refill_ms = now;
        state.carry = 0;
        return;
    }
    let elapsed = now - state.last_refill_ms;
    if elapsed == 0 {
        return;
    }
    let accrued = elapsed
        .saturating_mul(state.rate)
        .saturating_add(state.carry);
    let bytes = to_i64(accrued / 1000);
    state.carry = accrued % 1000;
    state.available = state.available.saturating_add(bytes).min(burst);
    if state.available == burst {
        state.carry = 0;
    }
    state.last_refill_ms = now;
}
