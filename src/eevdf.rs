//! The EEVDF parameter machine (spec §4.3).
//!
//! Computes `slice_duration`, `virtual_runtime`, `lag`,
//! `eligible_time`, and `virtual_deadline` on enqueue, requeue, tick,
//! and wake-up. Grounded on the teacher's
//! `scheduler/priority.rs::{calc_delta_vruntime, calc_vdeadline,
//! is_eligible, place_entity, update_curr}`, generalized from the
//! teacher's simplified single-capacity model to the capacity- and
//! context-aware version spec §4.3 requires.

use crate::config::{
    self, HIGH_CONTENTION_FACTOR, HIGH_CONTENTION_QUEUE_DEPTH, INSTANT_LOAD_EWMA_ALPHA,
    MAX_LOAD, MAX_SLICE_DURATION, MIN_GRANULARITY, MIN_TRANSITIONS, NOMINAL_CAPACITY,
    TARGET_LATENCY, WEIGHT_SCALE,
};
use crate::load;
use crate::thread::ThreadRecord;
use crate::time::{Duration, Instant};

/// Inputs describing the CPU a thread is being placed on or is
/// running on, used to normalize slice and entitlement by capacity.
#[derive(Debug, Clone, Copy)]
pub struct PlacementContext {
    /// `performance_capacity` of the context core, if known.
    pub capacity: Option<u32>,
    /// The context CPU's cached `min_virtual_runtime`, if known.
    pub context_min_vruntime: Option<i64>,
    /// Global minimum virtual runtime.
    pub global_min_vruntime: i64,
    /// Current ready-queue depth of the context CPU (for the
    /// high-contention slice floor, §4.3 step 4).
    pub queue_depth: usize,
}

impl PlacementContext {
    fn capacity_or_nominal(&self) -> u32 {
        self.capacity.unwrap_or(NOMINAL_CAPACITY)
    }

    fn reference_min_vruntime(&self) -> i64 {
        match self.context_min_vruntime {
            Some(local) => local.max(self.global_min_vruntime),
            None => self.global_min_vruntime,
        }
    }
}

/// Step 1-5 of §4.3: computes `slice_duration` from priority band,
/// latency-nice, the I/O-bound heuristic, and contention.
pub fn compute_slice(thread: &ThreadRecord, ctx: &PlacementContext) -> Duration {
    if thread.is_idle {
        return MAX_SLICE_DURATION;
    }

    let band = config::map_priority_to_band(thread.effective_priority);
    let base = config::K_BASE_QUANTA[band];

    let factor = config::latency_nice_factor(thread.latency_nice) as u64;
    let mut slice = Duration::from_micros((base.as_micros() * factor) >> config::LATENCY_NICE_FACTORS_SHIFT);

    if thread.voluntary_sleep_transitions >= MIN_TRANSITIONS && thread.average_run_burst_ewma < slice {
        let ewma = thread.average_run_burst_ewma;
        let bump = (ewma.as_micros() / 4).max(MIN_GRANULARITY.as_micros() / 2);
        slice = Duration::from_micros(ewma.as_micros().saturating_add(bump));
    }

    if ctx.queue_depth > HIGH_CONTENTION_QUEUE_DEPTH {
        let floor = MIN_GRANULARITY.saturating_mul(HIGH_CONTENTION_FACTOR);
        if slice < floor {
            slice = floor;
        }
    }

    slice.clamp(MIN_GRANULARITY, MAX_SLICE_DURATION)
}

/// Applies the full §4.3 parameter recomputation to `thread` in
/// place: slice, virtual runtime rebase, weighted entitlement, lag,
/// eligible time, and virtual deadline.
pub fn compute_params(
    thread: &mut ThreadRecord,
    ctx: &PlacementContext,
    is_new_or_relocated: bool,
    is_requeue: bool,
    now: Instant,
) {
    thread.slice_duration = compute_slice(thread, ctx);

    if thread.is_idle {
        thread.eligible_time = now;
        thread.virtual_deadline = now;
        return;
    }

    let capacity = ctx.capacity_or_nominal();
    let weight = thread.weight.max(1);

    let r = ctx.reference_min_vruntime();
    if is_new_or_relocated || thread.virtual_runtime < r {
        thread.virtual_runtime = thread.virtual_runtime.max(r);
    }

    let normalized_slice = (thread.slice_duration.as_micros() as i64) * capacity as i64 / NOMINAL_CAPACITY as i64;
    let entitlement = normalized_slice.saturating_mul(WEIGHT_SCALE as i64) / weight as i64;

    thread.lag = if is_requeue {
        thread.lag.saturating_add(entitlement)
    } else {
        entitlement.saturating_sub(thread.virtual_runtime.saturating_sub(r))
    };

    thread.eligible_time = if thread.is_real_time() || thread.lag >= 0 {
        now
    } else {
        let delay_micros = ((-thread.lag) as i128 * weight as i128 * NOMINAL_CAPACITY as i128)
            / (WEIGHT_SCALE as i128 * capacity.max(1) as i128);
        let delay = Duration::from_micros(delay_micros.clamp(0, u64::MAX as i128) as u64)
            .clamp(MIN_GRANULARITY, TARGET_LATENCY.saturating_mul(2));
        now.saturating_add(delay)
    };

    thread.virtual_deadline = thread.eligible_time.saturating_add(thread.slice_duration);
}

/// Eligibility as consulted by the dispatch scan (§4.2): a thread may
/// run once wall-clock time has reached its `eligible_time`.
pub fn is_eligible(thread: &ThreadRecord, now: Instant) -> bool {
    now >= thread.eligible_time
}

/// `RUNNING -> READY` accounting (§4.10): charge the elapsed,
/// capacity-normalized, weighted active time against `virtual_runtime`
/// and `lag` before requeueing.
pub fn account_active_time(thread: &mut ThreadRecord, active: Duration, capacity: u32) {
    let weight = thread.weight.max(1);
    let normalized = (active.as_micros() as i64) * capacity as i64 / NOMINAL_CAPACITY as i64;
    let weighted = normalized.saturating_mul(WEIGHT_SCALE as i64) / weight as i64;
    thread.virtual_runtime = thread.virtual_runtime.saturating_add(weighted);
    thread.lag = thread.lag.saturating_sub(weighted);
}

/// Updates `needed_load` (§3.1, §4.5): a long-window EWMA of demand,
/// sampled as `active` time out of the thread's last-computed
/// `slice_duration`, in `[0, MAX_LOAD]`. Must run before
/// [`compute_params`] overwrites `slice_duration` for the next
/// quantum, so it always samples against the slice the thread was
/// actually just ticked or slept out of.
pub fn update_needed_load(thread: &mut ThreadRecord, active: Duration) {
    let slice_us = thread.slice_duration.as_micros().max(1);
    let sample = ((active.as_micros() * MAX_LOAD as u64) / slice_us).min(MAX_LOAD as u64) as u32;
    thread.needed_load = load::ewma_update(thread.needed_load, sample, INSTANT_LOAD_EWMA_ALPHA / 4);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::priority;

    fn ctx(capacity: u32, depth: usize) -> PlacementContext {
        PlacementContext { capacity: Some(capacity), context_min_vruntime: Some(0), global_min_vruntime: 0, queue_depth: depth }
    }

    fn normal_thread() -> ThreadRecord {
        let mut t = ThreadRecord::new(priority::LOWEST_ACTIVE, 0, None);
        t.recompute_priority();
        t
    }

    #[test]
    fn slice_is_always_within_bounds() {
        let t = normal_thread();
        for depth in [0usize, 5, 20] {
            for nice in [-20i32, -5, 0, 5, 19] {
                let mut t = t.clone();
                t.latency_nice = nice;
                let slice = compute_slice(&t, &ctx(1024, depth));
                assert!(slice >= MIN_GRANULARITY && slice <= MAX_SLICE_DURATION);
            }
        }
    }

    #[test]
    fn idle_thread_gets_max_slice() {
        let t = ThreadRecord::new_idle();
        assert_eq!(compute_slice(&t, &ctx(1024, 0)), MAX_SLICE_DURATION);
    }

    #[test]
    fn high_contention_floors_the_slice() {
        let mut t = normal_thread();
        t.latency_nice = -20; // would otherwise shrink the slice
        let contended = compute_slice(&t, &ctx(1024, 50));
        let floor = MIN_GRANULARITY.saturating_mul(HIGH_CONTENTION_FACTOR);
        assert!(contended >= floor);
    }

    #[test]
    fn new_thread_snaps_vruntime_to_reference_minimum() {
        let mut t = normal_thread();
        t.virtual_runtime = -500;
        let c = PlacementContext { capacity: Some(1024), context_min_vruntime: Some(1000), global_min_vruntime: 500, queue_depth: 0 };
        compute_params(&mut t, &c, true, false, Instant::ZERO);
        assert_eq!(t.virtual_runtime, 1000);
    }

    #[test]
    fn negative_lag_delays_eligibility() {
        let mut t = normal_thread();
        t.virtual_runtime = 1_000_000;
        let c = ctx(1024, 0);
        compute_params(&mut t, &c, false, false, Instant::from_micros(1_000));
        assert!(t.lag < 0);
        assert!(t.eligible_time > Instant::from_micros(1_000));
        assert!(!is_eligible(&t, Instant::from_micros(1_000)));
    }

    #[test]
    fn nonnegative_lag_is_eligible_immediately() {
        let mut t = normal_thread();
        t.virtual_runtime = 0;
        let c = ctx(1024, 0);
        compute_params(&mut t, &c, true, false, Instant::from_micros(1_000));
        assert!(t.lag >= 0);
        assert_eq!(t.eligible_time, Instant::from_micros(1_000));
    }

    #[test]
    fn real_time_thread_is_always_eligible_now() {
        let mut t = normal_thread();
        t.base_priority = priority::RT_BAND;
        t.recompute_priority();
        t.virtual_runtime = 10_000_000;
        let c = ctx(1024, 0);
        compute_params(&mut t, &c, false, false, Instant::from_micros(42));
        assert_eq!(t.eligible_time, Instant::from_micros(42));
    }

    #[test]
    fn virtual_deadline_is_never_before_eligible_time() {
        let mut t = normal_thread();
        let c = ctx(1024, 0);
        compute_params(&mut t, &c, true, false, Instant::from_micros(10));
        assert!(t.virtual_deadline >= t.eligible_time);
    }

    #[test]
    fn requeue_accumulates_lag_by_entitlement() {
        let mut t = normal_thread();
        let c = ctx(1024, 0);
        compute_params(&mut t, &c, true, false, Instant::ZERO);
        let lag_before = t.lag;
        compute_params(&mut t, &c, false, true, Instant::ZERO);
        assert_eq!(t.lag, lag_before + t.slice_duration.as_micros() as i64 * WEIGHT_SCALE as i64 / t.weight as i64);
    }

    #[test]
    fn account_active_time_reduces_lag_and_advances_vruntime() {
        let mut t = normal_thread();
        t.lag = 1000;
        let before = t.virtual_runtime;
        account_active_time(&mut t, Duration::from_micros(1000), 1024);
        assert!(t.virtual_runtime > before);
        assert!(t.lag < 1000);
    }

    #[test]
    fn needed_load_converges_toward_fully_utilized_sample() {
        let mut t = normal_thread();
        t.slice_duration = Duration::from_micros(1000);
        for _ in 0..200 {
            update_needed_load(&mut t, Duration::from_micros(1000));
        }
        assert!(t.needed_load > MAX_LOAD * 9 / 10);
    }

    #[test]
    fn needed_load_converges_toward_zero_when_idle() {
        let mut t = normal_thread();
        t.slice_duration = Duration::from_micros(1000);
        t.needed_load = MAX_LOAD;
        for _ in 0..200 {
            update_needed_load(&mut t, Duration::ZERO);
        }
        assert!(t.needed_load < MAX_LOAD / 10);
    }
}
