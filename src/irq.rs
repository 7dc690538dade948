//! IRQ target-CPU selection (spec §4.9).
//!
//! `select_target_cpu_for_irq` picks the logical CPU that should
//! service a given interrupt, balancing dynamic IRQ capacity, SMT
//! contention, core energy efficiency, and optional colocation with
//! the interrupt's affinitized thread.

use hashbrown::HashMap;

use crate::arena::{CoreId, CpuId, ThreadId};
use crate::config::{
    IRQ_ALPHA_PERCENT, IRQ_CAP_ABSOLUTE_MIN, IRQ_CAP_MAX_FACTOR_DEN, IRQ_CAP_MAX_FACTOR_NUM,
    IRQ_CAP_MIN_FACTOR_DEN, IRQ_CAP_MIN_FACTOR_NUM, IRQ_COLOCATION_BONUS_DEN,
    IRQ_COLOCATION_BONUS_NUM, MAX_LOAD,
};
use crate::topology::Topology;

/// A hardware interrupt vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqId(pub u32);

/// A candidate CPU's inputs to the scoring function (§4.9 step 2).
#[derive(Debug, Clone, Copy)]
pub struct IrqCandidate {
    pub cpu: CpuId,
    /// Per-mille (out of 1000) instantaneous load, scaled same as
    /// `instantaneous_load_q16` elsewhere but pre-normalized by the
    /// caller for this computation.
    pub instant_load: u32,
    /// SMT penalty contribution, same units as `instant_load`.
    pub smt_penalty: u32,
    /// Existing IRQ load already assigned to this CPU.
    pub existing_irq_load: u32,
}

/// Tracks which thread each IRQ is colocated with, for the
/// colocation bonus in step 3. Bounded membership is enforced on the
/// thread side (`ThreadRecord::affinitized_irqs`, ≤
/// [`crate::config::MAX_AFFINITIZED_IRQS`]); this map is the reverse
/// index used by the router.
#[derive(Debug, Default)]
pub struct IrqAffinityMap {
    owner: HashMap<IrqId, ThreadId>,
}

impl IrqAffinityMap {
    pub fn new() -> Self {
        Self { owner: HashMap::new() }
    }

    pub fn set(&mut self, irq: IrqId, thread: ThreadId) {
        self.owner.insert(irq, thread);
    }

    pub fn clear(&mut self, irq: IrqId) {
        self.owner.remove(&irq);
    }

    pub fn owner_of(&self, irq: IrqId) -> Option<ThreadId> {
        self.owner.get(&irq).copied()
    }
}

/// `dynamic_cap = clamp(base * (max_f - load * (max_f - min_f)), abs_min, base * max_f * 1.1)`.
/// All factors are rationals to stay integer; `load` is in
/// `[0, MAX_LOAD]`.
fn dynamic_cap(base_mode_cap: u32, instant_load: u32) -> u32 {
    let load = instant_load.min(MAX_LOAD);
    let max_f_num = IRQ_CAP_MAX_FACTOR_NUM as u64;
    let max_f_den = IRQ_CAP_MAX_FACTOR_DEN as u64;
    let min_f_num = IRQ_CAP_MIN_FACTOR_NUM as u64;
    let min_f_den = IRQ_CAP_MIN_FACTOR_DEN as u64;

    // (max_f - min_f) as a single rational with common denominator max_f_den*min_f_den.
    let spread_num = max_f_num * min_f_den - min_f_num * max_f_den;
    let spread_den = max_f_den * min_f_den;

    let base = base_mode_cap as u64;
    let load_term = (base * spread_num * load as u64) / (spread_den * MAX_LOAD as u64);
    let unclamped = (base * max_f_num) / max_f_den;
    let scaled = unclamped.saturating_sub(load_term);

    let abs_min = IRQ_CAP_ABSOLUTE_MIN as u64;
    let abs_max = (base * max_f_num * 11) / (max_f_den * 10);
    scaled.clamp(abs_min, abs_max) as u32
}

/// `select_target_cpu_for_irq` (§4.9).
///
/// `base_mode_cap` is the mode's baseline IRQ-load budget per CPU;
/// `irq_load` is the estimated additional load this IRQ would add.
pub fn select_target_cpu_for_irq(
    topology: &Topology,
    affinity: &IrqAffinityMap,
    core: CoreId,
    irq: IrqId,
    irq_load: u32,
    candidates: &[IrqCandidate],
    base_mode_cap: u32,
    running_on: impl Fn(CpuId) -> Option<ThreadId>,
) -> Option<CpuId> {
    let owner = affinity.owner_of(irq);
    let energy_efficiency = topology.core(core).map(|c| c.energy_efficiency).unwrap_or(0);

    let mut best: Option<(CpuId, u64)> = None;
    for cand in candidates {
        let cap = dynamic_cap(base_mode_cap, cand.instant_load);
        if cand.existing_irq_load.saturating_add(irq_load) >= cap {
            continue;
        }

        let load_term = (cand.instant_load + cand.smt_penalty) as u64;
        let irq_term = cand.existing_irq_load as u64;
        let mut score = (100 - IRQ_ALPHA_PERCENT as u64) * load_term
            + IRQ_ALPHA_PERCENT as u64 * irq_term;

        // energy bonus: subtract proportionally, floor at 0.
        let bonus = score * energy_efficiency as u64 / 10_000;
        score = score.saturating_sub(bonus);

        if let Some(owner_thread) = owner {
            if running_on(cand.cpu) == Some(owner_thread) {
                score = score * IRQ_COLOCATION_BONUS_NUM as u64 / IRQ_COLOCATION_BONUS_DEN as u64;
            }
        }

        if best.map(|(_, best_score)| score < best_score).unwrap_or(true) {
            best = Some((cand.cpu, score));
        }
    }

    best.map(|(cpu, _)| cpu)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::CoreType;

    fn cand(cpu: u32, load: u32, smt: u32, irq_load: u32) -> IrqCandidate {
        IrqCandidate { cpu: CpuId::new(cpu as usize), instant_load: load, smt_penalty: smt, existing_irq_load: irq_load }
    }

    fn small_topology() -> (Topology, CoreId) {
        let mut topo = Topology::new();
        let pkg = topo.add_package();
        let core = topo.add_core(pkg, CoreType::Uniform, 1024, 0);
        topo.add_cpu(core);
        topo.add_cpu(core);
        (topo, core)
    }

    #[test]
    fn picks_least_loaded_cpu() {
        let (topo, core) = small_topology();
        let affinity = IrqAffinityMap::new();
        let candidates = [cand(0, 800, 0, 0), cand(1, 100, 0, 0)];
        let result = select_target_cpu_for_irq(&topo, &affinity, core, IrqId(1), 10, &candidates, 500, |_| None);
        assert_eq!(result, Some(CpuId::new(1)));
    }

    #[test]
    fn rejects_cpu_over_dynamic_cap() {
        let (topo, core) = small_topology();
        let affinity = IrqAffinityMap::new();
        let candidates = [cand(0, 0, 0, 10_000)];
        let result = select_target_cpu_for_irq(&topo, &affinity, core, IrqId(1), 10, &candidates, 10, |_| None);
        assert_eq!(result, None);
    }

    #[test]
    fn colocation_bonus_favors_owner_cpu() {
        let (topo, core) = small_topology();
        let mut affinity = IrqAffinityMap::new();
        let owner = ThreadId::new(5);
        affinity.set(IrqId(9), owner);
        // CPU 0 is slightly more loaded than CPU 1, but hosts the owner thread.
        let candidates = [cand(0, 300, 0, 0), cand(1, 250, 0, 0)];
        let result = select_target_cpu_for_irq(&topo, &affinity, core, IrqId(9), 5, &candidates, 1000, |cpu| {
            if cpu == CpuId::new(0) { Some(owner) } else { None }
        });
        assert_eq!(result, Some(CpuId::new(0)));
    }
}
