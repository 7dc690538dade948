//! Load accounting (spec §4.5) and the sharded core-load heaps
//! (spec §3.6, §9).
//!
//! Per-CPU `instantaneous_load` and `long_window_load` are both EWMAs
//! over "fraction of wall time spent running a non-idle thread",
//! grounded on the teacher's `PerCpuSchedData::update_load_average`
//! EMA (`old*7 + current) / 8`). Global and per-shard core-load heaps
//! are `BTreeMap`-backed so cheap migrate-in/migrate-out re-keying
//! doesn't need a hand-rolled binary heap; spec §9 asks only that they
//! be `Send + Sync` behind sharded rw-locks, not for a particular heap
//! implementation.

use alloc::collections::BTreeMap;

use spin::RwLock;

use crate::arena::CoreId;
use crate::config::{HIGH_LOAD_THRESHOLD, INSTANT_LOAD_EWMA_ALPHA, LOAD_HEAP_SHARDS, LOAD_REHEAP_DELTA, MAX_LOAD};

/// EWMA update for `instantaneous_load`, in `[0, MAX_LOAD]` fixed
/// point. `sample` is this interval's observed load, same scale.
pub fn ewma_update(previous: u32, sample: u32, alpha_num: u32) -> u32 {
    let alpha = alpha_num as u64;
    let prev = previous as u64;
    let s = sample as u64;
    ((prev * (256 - alpha) + s * alpha) / 256) as u32
}

pub fn update_instantaneous_load(previous: u32, sample: u32) -> u32 {
    ewma_update(previous, sample, INSTANT_LOAD_EWMA_ALPHA).min(MAX_LOAD)
}

/// Per-core aggregate load: the mean of its enabled CPUs'
/// `long_window_load` values (§4.5).
pub fn aggregate_core_load(cpu_loads: impl Iterator<Item = u32>) -> u32 {
    let mut sum = 0u64;
    let mut count = 0u64;
    for load in cpu_loads {
        sum += load as u64;
        count += 1;
    }
    if count == 0 {
        0
    } else {
        (sum / count) as u32
    }
}

/// Whether a load change is large enough, or crosses the high-load
/// threshold, to force a core to be re-keyed in the sharded heaps.
pub fn needs_reheap(old_load: u32, new_load: u32) -> bool {
    let delta = old_load.abs_diff(new_load);
    let crossed_high = (old_load >= HIGH_LOAD_THRESHOLD) != (new_load >= HIGH_LOAD_THRESHOLD);
    delta > LOAD_REHEAP_DELTA || crossed_high
}

/// One shard of the global core-load structure: an ordered map keyed
/// by `(load, core_id.index())` so `first_key_value`/`last_key_value`
/// give the min/max-loaded core in that shard in O(log n).
#[derive(Default)]
struct Shard {
    by_load: BTreeMap<(u32, u32), CoreId>,
}

/// Sharded min/max heaps of cores by load, keyed by `core_id mod N`
/// (spec §3.6, §9): caps per-shard lock contention versus one global
/// structure.
pub struct ShardedCoreHeaps {
    shards: alloc::vec::Vec<RwLock<Shard>>,
}

impl ShardedCoreHeaps {
    pub fn new() -> Self {
        let mut shards = alloc::vec::Vec::with_capacity(LOAD_HEAP_SHARDS);
        for _ in 0..LOAD_HEAP_SHARDS {
            shards.push(RwLock::new(Shard::default()));
        }
        ShardedCoreHeaps { shards }
    }

    fn shard_index(core: CoreId) -> usize {
        core.index() % LOAD_HEAP_SHARDS
    }

    /// Insert or move a core to its new load key. `old_load` is
    /// `None` on first insertion.
    pub fn set_load(&self, core: CoreId, old_load: Option<u32>, new_load: u32) {
        let idx = Self::shard_index(core);
        let mut shard = self.shards[idx].write();
        if let Some(old) = old_load {
            shard.by_load.remove(&(old, core.index() as u32));
        }
        shard.by_load.insert((new_load, core.index() as u32), core);
    }

    pub fn remove(&self, core: CoreId, load: u32) {
        let idx = Self::shard_index(core);
        self.shards[idx].write().by_load.remove(&(load, core.index() as u32));
    }

    /// Least-loaded core across all shards.
    pub fn min_loaded(&self) -> Option<CoreId> {
        self.shards
            .iter()
            .filter_map(|s| s.read().by_load.iter().next().map(|(k, v)| (*k, *v)))
            .min_by_key(|(k, _)| *k)
            .map(|(_, core)| core)
    }

    /// Most-loaded core across all shards.
    pub fn max_loaded(&self) -> Option<CoreId> {
        self.shards
            .iter()
            .filter_map(|s| s.read().by_load.iter().next_back().map(|(k, v)| (*k, *v)))
            .max_by_key(|(k, _)| *k)
            .map(|(_, core)| core)
    }

    /// Cores whose load is at or above [`HIGH_LOAD_THRESHOLD`].
    pub fn high_load_cores(&self) -> alloc::vec::Vec<CoreId> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .by_load
                    .range((HIGH_LOAD_THRESHOLD, 0)..)
                    .map(|(_, core)| *core)
                    .collect::<alloc::vec::Vec<_>>()
            })
            .collect()
    }

    /// Cores below [`HIGH_LOAD_THRESHOLD`], ascending by load.
    pub fn low_load_cores(&self) -> alloc::vec::Vec<CoreId> {
        self.shards
            .iter()
            .flat_map(|s| {
                s.read()
                    .by_load
                    .range(..(HIGH_LOAD_THRESHOLD, 0))
                    .map(|(_, core)| *core)
                    .collect::<alloc::vec::Vec<_>>()
            })
            .collect()
    }
}

impl Default for ShardedCoreHeaps {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_converges_toward_sample_over_iterations() {
        let mut load = 0u32;
        for _ in 0..200 {
            load = update_instantaneous_load(load, MAX_LOAD);
        }
        assert!(load > MAX_LOAD * 9 / 10);
    }

    #[test]
    fn aggregate_load_is_the_mean() {
        let loads = [200u32, 400, 600];
        assert_eq!(aggregate_core_load(loads.into_iter()), 400);
    }

    #[test]
    fn aggregate_load_of_no_cpus_is_zero() {
        assert_eq!(aggregate_core_load(core::iter::empty()), 0);
    }

    #[test]
    fn reheap_triggers_on_large_delta_or_threshold_crossing() {
        assert!(!needs_reheap(500, 520));
        assert!(needs_reheap(500, 500 + LOAD_REHEAP_DELTA + 1));
        assert!(needs_reheap(HIGH_LOAD_THRESHOLD - 1, HIGH_LOAD_THRESHOLD));
    }

    #[test]
    fn sharded_heaps_track_min_and_max() {
        let heaps = ShardedCoreHeaps::new();
        heaps.set_load(CoreId::new(0), None, 100);
        heaps.set_load(CoreId::new(1), None, 900);
        heaps.set_load(CoreId::new(2), None, 500);
        assert_eq!(heaps.min_loaded(), Some(CoreId::new(0)));
        assert_eq!(heaps.max_loaded(), Some(CoreId::new(1)));
    }

    #[test]
    fn moving_a_core_updates_its_key() {
        let heaps = ShardedCoreHeaps::new();
        heaps.set_load(CoreId::new(0), None, 100);
        heaps.set_load(CoreId::new(0), Some(100), 950);
        assert_eq!(heaps.max_loaded(), Some(CoreId::new(0)));
    }

    #[test]
    fn high_and_low_load_partitions_are_disjoint() {
        let heaps = ShardedCoreHeaps::new();
        heaps.set_load(CoreId::new(0), None, 100);
        heaps.set_load(CoreId::new(1), None, HIGH_LOAD_THRESHOLD + 10);
        let high = heaps.high_load_cores();
        let low = heaps.low_load_cores();
        assert!(high.contains(&CoreId::new(1)));
        assert!(low.contains(&CoreId::new(0)));
        assert!(!high.contains(&CoreId::new(0)));
    }
}
