//! Scheduler tunables.
//!
//! Grouped the way the teacher's `scheduler/types.rs` groups its EEVDF
//! constants. Everything here is a compile-time constant; there is no
//! runtime configuration file — a kernel wanting different tunables
//! forks these values, same as upstream CFS/EEVDF tunables live in
//! `kernel/sched/`.

use crate::time::Duration;

/// A core's nominal compute capacity. Real cores scale relative to
/// this; a LITTLE core might report 512, a BIG core 1024 or more.
pub const NOMINAL_CAPACITY: u32 = 1024;

/// Fixed-point weight scale: nice 0 / normal priority maps to this
/// weight exactly (spec §9, open question — table shape is a
/// tunable, but nice-0 == `WEIGHT_SCALE` is the contract).
pub const WEIGHT_SCALE: u32 = 1024;

/// Ceiling for `long_window_load` and `needed_load` EWMAs.
pub const MAX_LOAD: u32 = 1024;

/// Lower clamp for any computed slice (§4.3 step 5).
pub const MIN_GRANULARITY: Duration = Duration::from_micros(750);

/// Upper clamp for any computed slice (§4.3 step 5).
pub const MAX_SLICE_DURATION: Duration = Duration::from_micros(24_000);

/// EEVDF target latency: the nominal period within which every
/// eligible thread should get a turn. Used as the ceiling on the
/// eligibility delay computation (§4.3).
pub const TARGET_LATENCY: Duration = Duration::from_micros(12_000);

/// Floor applied to slice when the context CPU's run queue is deeply
/// contended (§4.3 step 4).
pub const HIGH_CONTENTION_FACTOR: u64 = 2;

/// Run-queue depth beyond which a CPU is considered "high contention"
/// for slice-floor purposes (§4.3 step 4).
pub const HIGH_CONTENTION_QUEUE_DEPTH: usize = 8;

/// Minimum number of observed voluntary sleep transitions before the
/// I/O-bound heuristic (§4.3 step 3) trusts `average_run_burst_ewma`.
pub const MIN_TRANSITIONS: u32 = 3;

/// EWMA smoothing factor (numerator over 256) for
/// `instantaneous_load` (§4.5).
pub const INSTANT_LOAD_EWMA_ALPHA: u32 = 77; // ~0.3 * 256

/// EWMA smoothing factor (numerator over 256) for
/// `average_run_burst_ewma` (§4.3 step 3).
pub const BURST_EWMA_ALPHA: u32 = 64; // 0.25 * 256

/// Fraction of a sibling's instantaneous load counted against this
/// CPU's SMT-aware score (§4.8).
pub const SMT_CONFLICT_FACTOR_NUM: u32 = 3;
pub const SMT_CONFLICT_FACTOR_DEN: u32 = 4; // 0.75

/// Cache-affinity threshold: a thread's previous CPU is preferred
/// only while its `effective_smt_load` stays below this (§4.8).
pub const CACHE_AFFINITY_SMT_LOAD_THRESHOLD_NUM: u32 = 3;
pub const CACHE_AFFINITY_SMT_LOAD_THRESHOLD_DEN: u32 = 4; // 0.75

/// Minimum interval between periodic load-balancer runs on a CPU.
pub const BALANCE_INTERVAL_MIN: Duration = Duration::from_millis(20);
/// Initial periodic load-balancer interval.
pub const BALANCE_INTERVAL_DEFAULT: Duration = Duration::from_millis(100);
/// Maximum interval between periodic load-balancer runs on a CPU.
pub const BALANCE_INTERVAL_MAX: Duration = Duration::from_millis(500);

/// Minimum time a thread must remain on its current core before it is
/// eligible for another migration (§4.7, property 8).
pub const MIGRATION_COOLDOWN: Duration = Duration::from_millis(10);

/// A thread's `lag` must exceed this before the balancer or a stealer
/// will move it (§4.7): prevents shuffling near-entitled threads.
pub const MIN_LAG_TO_STEAL: i64 = (WEIGHT_SCALE / 8) as i64;

/// Minimum interval before the same victim CPU can be stolen from
/// again (§4.7).
pub const VICTIM_COOLDOWN: Duration = Duration::from_micros(500);

/// Tail candidates inspected per victim during a steal attempt (§4.7).
pub const MAX_STEAL_CANDIDATES_TO_CHECK: usize = 4;

/// Threads sampled from a high-loaded source run queue per periodic
/// balancer pass (§4.7); distinct from [`MAX_STEAL_CANDIDATES_TO_CHECK`],
/// which bounds opportunistic stealing instead.
pub const BALANCE_SAMPLE_SIZE: usize = 4;

/// Backoff applied to `next_steal_attempt_time` after a failed steal.
pub const STEAL_FAILURE_BACKOFF: Duration = Duration::from_micros(200);

/// Cooldown applied to `next_steal_attempt_time` after a successful
/// steal (keeps a CPU from immediately re-stealing from the same
/// victim it just took from).
pub const STEAL_SUCCESS_COOLDOWN: Duration = Duration::from_micros(1_000);

/// Load delta (out of [`MAX_LOAD`]) large enough to force a core to be
/// re-keyed in its sharded load heap even without crossing the
/// high-load threshold (§4.5).
pub const LOAD_REHEAP_DELTA: u32 = MAX_LOAD / 20;

/// Long-window load at or above which a core is flagged `high_load`.
pub const HIGH_LOAD_THRESHOLD: u32 = (MAX_LOAD * 3) / 4;

/// Number of shards backing the global core-load heaps (§3.6, §9):
/// caps per-shard lock contention.
pub const LOAD_HEAP_SHARDS: usize = 8;

/// Weight used to advance `team_virtual_runtime` (§4.4); distinct from
/// per-thread weight, deliberately fixed so quota accounting doesn't
/// depend on which threads happen to be running.
pub const BASE_WEIGHT: u32 = WEIGHT_SCALE;

/// `dynamic_cap` clamp bounds for the IRQ router (§4.9).
pub const IRQ_CAP_MAX_FACTOR_NUM: u32 = 3;
pub const IRQ_CAP_MAX_FACTOR_DEN: u32 = 2; // 1.5x base at zero load
pub const IRQ_CAP_MIN_FACTOR_NUM: u32 = 1;
pub const IRQ_CAP_MIN_FACTOR_DEN: u32 = 2; // 0.5x base at full load
pub const IRQ_CAP_ABSOLUTE_MIN: u32 = 1;

/// `(1-alpha)`/`alpha` split between instant-load term and existing
/// IRQ load term in the router's scoring function (§4.9); expressed as
/// a numerator over 100 so it stays integer.
pub const IRQ_ALPHA_PERCENT: u32 = 40;

/// Strong colocation bonus multiplier applied to an IRQ's score when
/// its affinitized thread runs on the candidate CPU (§4.9).
pub const IRQ_COLOCATION_BONUS_NUM: u32 = 1;
pub const IRQ_COLOCATION_BONUS_DEN: u32 = 10;

/// Maximum affinitized IRQs tracked per thread (§3.1, §4.9).
pub const MAX_AFFINITIZED_IRQS: usize = 4;

/// Thread priority bands. Real-time threads are always dispatched
/// ahead of non-RT threads of the active team; idle is the synthetic
/// per-CPU filler thread, never enqueued.
pub mod priority {
    /// Priorities `[0, IDLE_BAND)` are the idle band (never queued).
    pub const IDLE_BAND: i32 = 1;
    /// Priorities `[IDLE_BAND, RT_BAND)` are normal/batch priorities.
    pub const RT_BAND: i32 = 100;
    /// Priorities `[RT_BAND, MAX_PRIORITY]` are real-time.
    pub const MAX_PRIORITY: i32 = 127;
    /// Lowest active (non-idle) priority value.
    pub const LOWEST_ACTIVE: i32 = IDLE_BAND;
}

/// Linux CFS-derived nice-to-weight table (nice -20..=19), the same
/// table used by `Daemoniorum-LLC-nyx-os`'s `sched/cfs.rs`. Nice 0
/// maps to index 20, value `WEIGHT_SCALE`.
pub const NICE_TO_WEIGHT: [u32; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110, 87,
    70, 56, 45, 36, 29, 23, 18, 15,
];

/// Latency-nice factor table, `Q8.8` fixed point (shift right by 8
/// after multiplying). Symmetric and monotone around latency-nice 0
/// (index 20) as required by spec §9: lower latency-nice shortens the
/// slice, higher lengthens it.
pub const LATENCY_NICE_FACTORS_SHIFT: u32 = 8;
pub const LATENCY_NICE_FACTORS: [u32; 40] = [
    64, 72, 80, 90, 100, 112, 128, 144, 160, 180, 202, 226, 256, 287, 322, 362, 406, 456, 512, 574,
    256, 287, 322, 362, 406, 456, 512, 574, 644, 724, 812, 912, 1024, 1149, 1290, 1448, 1625, 1825,
    2048, 2299,
];

/// Base quantum table indexed by priority band (idle/normal/rt).
pub const K_BASE_QUANTA: [Duration; 3] = [
    Duration::from_micros(0),      // idle, unused (idle never computes a slice)
    Duration::from_micros(6_000),  // normal band
    Duration::from_micros(12_000), // real-time band
];

/// Maps a thread priority to `K_BASE_QUANTA`'s band index.
pub fn map_priority_to_band(priority: i32) -> usize {
    if priority < priority::IDLE_BAND {
        0
    } else if priority < priority::RT_BAND {
        1
    } else {
        2
    }
}

/// Looks up a weight from [`NICE_TO_WEIGHT`], clamping nice to
/// `[-20, 19]` first.
pub fn nice_to_weight(nice: i32) -> u32 {
    let clamped = nice.clamp(-20, 19);
    NICE_TO_WEIGHT[(clamped + 20) as usize]
}

/// Looks up the Q8.8 latency-nice factor, clamping to `[-20, 19]`.
pub fn latency_nice_factor(latency_nice: i32) -> u32 {
    let clamped = latency_nice.clamp(-20, 19);
    LATENCY_NICE_FACTORS[(clamped + 20) as usize]
}
