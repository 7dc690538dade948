//! Initial placement and SMT-aware CPU selection (spec §4.6, §4.8).
//!
//! `choose_core_and_cpu` is mode-pluggable (§4.6): each mode exposes
//! `choose_core`, resolved once at scheduler construction and cached
//! as a trait object rather than re-dispatched per tick (spec §9,
//! "resolve the mode once and cache a function pointer"). Naming
//! follows `scx_p2dq`'s `SchedMode::{Default, Performance, Efficiency}`
//! (`examples/other_examples/..._scx_p2dq-src-lib.rs.rs`).

use crate::arena::{CoreId, CpuId};
use crate::config::{
    CACHE_AFFINITY_SMT_LOAD_THRESHOLD_DEN, CACHE_AFFINITY_SMT_LOAD_THRESHOLD_NUM, MAX_LOAD,
    SMT_CONFLICT_FACTOR_DEN, SMT_CONFLICT_FACTOR_NUM,
};
use crate::cpu_mask::CpuMask;
use crate::error::SchedError;
use crate::load::ShardedCoreHeaps;
use crate::thread::ThreadRecord;
use crate::time::Instant;
use crate::topology::{CoreRecord, CoreType, Topology};

/// `effective_smt_load` (§4.8): a CPU's own instantaneous load plus a
/// discounted share of its SMT siblings' load.
pub fn effective_smt_load(own_instant_load: u32, siblings: impl Iterator<Item = u32>) -> u32 {
    let mut total = own_instant_load as u64;
    for sibling in siblings {
        total += sibling as u64 * SMT_CONFLICT_FACTOR_NUM as u64 / SMT_CONFLICT_FACTOR_DEN as u64;
    }
    total.min(u32::MAX as u64) as u32
}

/// Heap key: lower effective load maps to a higher key so the core's
/// CPU priority heap is a max-heap favoring the least-loaded CPU.
pub fn heap_key_for_load(effective_load: u32) -> u32 {
    MAX_LOAD.saturating_sub(effective_load.min(MAX_LOAD))
}

fn is_cache_affinity_viable(effective_load: u32) -> bool {
    effective_load * CACHE_AFFINITY_SMT_LOAD_THRESHOLD_DEN
        < MAX_LOAD * CACHE_AFFINITY_SMT_LOAD_THRESHOLD_NUM
}

/// `choose_cpu(core)` (§4.8): prefers the thread's `previous_cpu` if
/// it is on this core and not SMT-hot, otherwise scans enabled CPUs
/// on the core and returns the one with the highest heap key, ties
/// broken by shallower queue depth.
pub fn choose_cpu(
    core: CoreId,
    previous_cpu: Option<CpuId>,
    topology: &Topology,
    instant_load_of: impl Fn(CpuId) -> u32,
    queue_depth_of: impl Fn(CpuId) -> usize,
) -> Option<CpuId> {
    let cpus_on_core: alloc::vec::Vec<CpuId> =
        topology.cpus_on_core(core).filter(|c| topology.cpu(*c).map(|r| r.enabled).unwrap_or(false)).collect();
    if cpus_on_core.is_empty() {
        return None;
    }

    if let Some(prev) = previous_cpu {
        if cpus_on_core.contains(&prev) {
            let siblings = topology.siblings_of(prev).map(&instant_load_of);
            let effective = effective_smt_load(instant_load_of(prev), siblings);
            if is_cache_affinity_viable(effective) {
                return Some(prev);
            }
        }
    }

    cpus_on_core
        .into_iter()
        .map(|cpu| {
            let siblings = topology.siblings_of(cpu).map(&instant_load_of);
            let effective = effective_smt_load(instant_load_of(cpu), siblings);
            let key = heap_key_for_load(effective);
            (cpu, key, queue_depth_of(cpu))
        })
        .max_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
        .map(|(cpu, _, _)| cpu)
}

/// Inputs a placement mode needs to pick a core (§4.6 step 2).
pub struct CoreChoiceQuery<'a> {
    pub affinity: &'a CpuMask,
    pub needed_load: u32,
    pub preferred_package: Option<crate::arena::PackageId>,
}

/// A scheduler mode's core-selection policy (§4.6, §9).
pub trait PlacementMode: Send + Sync {
    fn choose_core(&self, query: &CoreChoiceQuery<'_>, topology: &Topology, loads: &ShardedCoreHeaps) -> Option<CoreId>;
}

fn core_matches_affinity(topology: &Topology, core: CoreId, affinity: &CpuMask) -> bool {
    topology.cpus_on_core(core).any(|cpu| affinity.is_set(cpu))
}

/// Capacity-normalized projected load: `(core.load + needed_load) /
/// performance_capacity`, same normalization `eevdf.rs` uses for
/// entitlement. A flat `needed_load` (the candidate thread's own
/// projected demand, §3.1) therefore weighs less on a higher-capacity
/// core, letting it tip the choice between two cores that are equally
/// loaded right now but differ in capacity (the common big.LITTLE
/// case `PerformanceMode`/`PowerSavingMode` care about).
fn projected_load_score(core: &CoreRecord, needed_load: u32) -> u64 {
    let projected = (core.load as u64).saturating_add(needed_load as u64);
    projected.saturating_mul(1000) / core.performance_capacity.max(1) as u64
}

/// Picks the candidate with the lowest [`projected_load_score`].
fn least_loaded_with_headroom(candidates: &[(u32, &CoreRecord)], needed_load: u32) -> Option<CoreId> {
    candidates
        .iter()
        .min_by_key(|(_, c)| projected_load_score(c, needed_load))
        .map(|(idx, _)| CoreId::new(*idx as usize))
}

/// Throughput-first: always prefer the least-loaded eligible core,
/// regardless of energy efficiency or core type.
pub struct PerformanceMode;

impl PlacementMode for PerformanceMode {
    fn choose_core(&self, query: &CoreChoiceQuery<'_>, topology: &Topology, loads: &ShardedCoreHeaps) -> Option<CoreId> {
        // Prefer BIG cores when heterogeneous topology info is present,
        // falling back to the globally least-loaded core.
        let big_candidates: alloc::vec::Vec<(u32, &CoreRecord)> = topology
            .cores_iter()
            .filter(|(_, c)| !c.defunct && c.core_type == CoreType::Big)
            .filter(|(idx, _)| core_matches_affinity(topology, CoreId::new(*idx as usize), query.affinity))
            .collect();
        let big_core = least_loaded_with_headroom(&big_candidates, query.needed_load);

        big_core.or_else(|| find_least_loaded_matching(query, topology, loads))
    }
}

/// Power-saving: prefer LITTLE cores and idle packages, accepting
/// higher queueing latency for lower energy draw.
pub struct PowerSavingMode;

impl PlacementMode for PowerSavingMode {
    fn choose_core(&self, query: &CoreChoiceQuery<'_>, topology: &Topology, loads: &ShardedCoreHeaps) -> Option<CoreId> {
        let little_candidates: alloc::vec::Vec<(u32, &CoreRecord)> = topology
            .cores_iter()
            .filter(|(_, c)| !c.defunct && c.core_type == CoreType::Little)
            .filter(|(idx, _)| core_matches_affinity(topology, CoreId::new(*idx as usize), query.affinity))
            .collect();
        let little_core = least_loaded_with_headroom(&little_candidates, query.needed_load);

        little_core.or_else(|| find_least_loaded_matching(query, topology, loads))
    }
}

fn find_least_loaded_matching(query: &CoreChoiceQuery<'_>, topology: &Topology, loads: &ShardedCoreHeaps) -> Option<CoreId> {
    if let Some(core) = loads.min_loaded() {
        if core_matches_affinity(topology, core, query.affinity) {
            return Some(core);
        }
    }
    // Fall back to a linear scan restricted to compatible cores; the
    // heap gave us the global minimum but it may not satisfy affinity.
    let candidates: alloc::vec::Vec<(u32, &CoreRecord)> = topology
        .cores_iter()
        .filter(|(_, c)| !c.defunct)
        .filter(|(idx, _)| core_matches_affinity(topology, CoreId::new(*idx as usize), query.affinity))
        .collect();
    least_loaded_with_headroom(&candidates, query.needed_load)
}

/// Outcome of `choose_core_and_cpu`.
pub struct Placement {
    pub core: CoreId,
    pub cpu: CpuId,
    pub migrated: bool,
}

/// `choose_core_and_cpu` (§4.6). `core_hint`/`cpu_hint` come from the
/// caller (e.g. a pinned CPU); they are validated against affinity
/// and discarded if incompatible.
#[allow(clippy::too_many_arguments)]
pub fn choose_core_and_cpu(
    thread: &mut ThreadRecord,
    mode: &dyn PlacementMode,
    topology: &Topology,
    loads: &ShardedCoreHeaps,
    core_hint: Option<CoreId>,
    cpu_hint: Option<CpuId>,
    now: Instant,
    instant_load_of: impl Fn(CpuId) -> u32,
    queue_depth_of: impl Fn(CpuId) -> usize,
) -> Result<Placement, SchedError> {
    let valid_core_hint = core_hint.filter(|core| core_matches_affinity(topology, *core, &thread.cpu_mask));
    let valid_cpu_hint = cpu_hint.filter(|cpu| thread.can_run_on(*cpu) && valid_core_hint.map(|c| topology.cpu(*cpu).map(|r| r.core) == Some(c)).unwrap_or(true));

    let core = match valid_core_hint {
        Some(core) => core,
        None => {
            let query = CoreChoiceQuery { affinity: &thread.cpu_mask, needed_load: thread.needed_load, preferred_package: thread.preferred_package };
            mode.choose_core(&query, topology, loads).ok_or(SchedError::AffinityInfeasible)?
        }
    };

    let cpu = match valid_cpu_hint {
        Some(cpu) => cpu,
        None => choose_cpu(core, thread.previous_cpu, topology, &instant_load_of, &queue_depth_of).ok_or(SchedError::AffinityInfeasible)?,
    };

    let migrated = thread.home_core != Some(core);
    if migrated {
        thread.home_core = Some(core);
        thread.last_migration_time = now;
        thread.migration_count = thread.migration_count.saturating_add(1);
    }
    thread.previous_cpu = Some(cpu);

    Ok(Placement { core, cpu, migrated })
}
