//! Per-thread scheduling record (spec §3.1).
//!
//! Owned by the thread object in the embedding kernel; the scheduler
//! holds only an index (`ThreadId`) plus, while enqueued, a run-queue
//! handle. Mirrors the field layout in
//! `Daemoniorum-LLC-nyx-os/kernel/src/sched/thread.rs`'s `Thread`
//! struct, minus the architecture-specific register state (owned by
//! the trap/context-switch collaborator, out of scope here).

use heapless::Vec as HVec;

use crate::arena::{CoreId, CpuId, PackageId, TeamId};
use crate::config::{self, MAX_AFFINITIZED_IRQS};
use crate::cpu_mask::CpuMask;
use crate::irq::IrqId;
use crate::time::{Duration, Instant};

/// Thread scheduling state (spec §4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Created,
    /// Enqueued, waiting for dispatch.
    Ready,
    Running,
    Blocked,
    Exiting,
}

/// Per-thread EEVDF and placement state.
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub state: ThreadState,

    // --- identity / policy ---
    pub base_priority: i32,
    pub latency_nice: i32,
    pub effective_priority: i32,
    pub weight: u32,
    pub is_idle: bool,
    pub team: Option<TeamId>,

    // --- EEVDF parameters (§3.1, §4.3) ---
    pub slice_duration: Duration,
    pub virtual_runtime: i64,
    pub lag: i64,
    pub eligible_time: Instant,
    pub virtual_deadline: Instant,

    // --- slice-accounting scratch ---
    pub time_used_in_current_quantum: Duration,
    pub stolen_time: Duration,
    pub quantum_start_wall: Instant,

    // --- I/O-bound heuristic (§4.3 step 3) ---
    pub average_run_burst_ewma: Duration,
    pub voluntary_sleep_transitions: u32,

    // --- load contribution (§4.5) ---
    pub needed_load: u32,

    // --- placement ---
    pub home_core: Option<CoreId>,
    pub previous_cpu: Option<CpuId>,
    pub cpu_mask: CpuMask,
    pub pinned_cpu: Option<CpuId>,
    pub preferred_package: Option<PackageId>,
    pub last_migration_time: Instant,
    pub migration_count: u32,

    // --- IRQ colocation (§4.9) ---
    pub affinitized_irqs: HVec<IrqId, MAX_AFFINITIZED_IRQS>,

    // --- queue state ---
    pub enqueued: bool,
}

impl ThreadRecord {
    pub fn new(base_priority: i32, latency_nice: i32, team: Option<TeamId>) -> Self {
        let weight = if base_priority >= config::priority::RT_BAND {
            u32::MAX / 2
        } else {
            config::nice_to_weight(0)
        };
        ThreadRecord {
            state: ThreadState::Created,
            base_priority,
            latency_nice,
            effective_priority: base_priority.clamp(config::priority::LOWEST_ACTIVE, config::priority::MAX_PRIORITY),
            weight,
            is_idle: false,
            team,
            slice_duration: Duration::ZERO,
            virtual_runtime: 0,
            lag: 0,
            eligible_time: Instant::ZERO,
            virtual_deadline: Instant::ZERO,
            time_used_in_current_quantum: Duration::ZERO,
            stolen_time: Duration::ZERO,
            quantum_start_wall: Instant::ZERO,
            average_run_burst_ewma: Duration::ZERO,
            voluntary_sleep_transitions: 0,
            needed_load: 0,
            home_core: None,
            previous_cpu: None,
            cpu_mask: CpuMask::default(),
            pinned_cpu: None,
            preferred_package: None,
            last_migration_time: Instant::ZERO,
            migration_count: 0,
            affinitized_irqs: HVec::new(),
            enqueued: false,
        }
    }

    /// A synthetic per-CPU idle thread: never enqueued, infinite
    /// effective slice, lowest possible priority.
    pub fn new_idle() -> Self {
        let mut t = ThreadRecord::new(0, 0, None);
        t.is_idle = true;
        t.weight = 1;
        t
    }

    pub fn is_real_time(&self) -> bool {
        self.effective_priority >= config::priority::RT_BAND
    }

    pub fn can_run_on(&self, cpu: CpuId) -> bool {
        if let Some(pinned) = self.pinned_cpu {
            return pinned == cpu;
        }
        self.cpu_mask.is_set(cpu)
    }

    /// Recompute `effective_priority` and `weight` from
    /// `base_priority` after a policy/priority change.
    pub fn recompute_priority(&mut self) {
        self.effective_priority = self.base_priority.clamp(config::priority::LOWEST_ACTIVE, config::priority::MAX_PRIORITY);
        self.weight = if self.is_real_time() {
            u32::MAX / 2
        } else {
            config::nice_to_weight(0)
        };
    }

    /// Add an affinitized IRQ, enforcing the bounded-list and
    /// dedup contract (§3.1, §4.9).
    pub fn add_affinitized_irq(&mut self, irq: IrqId) -> Result<(), crate::error::SchedError> {
        if self.affinitized_irqs.contains(&irq) {
            return Ok(());
        }
        self.affinitized_irqs.push(irq).map_err(|_| crate::error::SchedError::PoolExhausted)
    }

    pub fn remove_affinitized_irq(&mut self, irq: IrqId) {
        if let Some(pos) = self.affinitized_irqs.iter().position(|i| *i == irq) {
            self.affinitized_irqs.swap_remove(pos);
        }
    }

    /// Voluntary sleep transition bookkeeping (§4.10 RUNNING ->
    /// BLOCKED): update the burst EWMA and bump the transition count.
    pub fn record_voluntary_sleep(&mut self, burst: Duration) {
        let alpha = config::BURST_EWMA_ALPHA as u64;
        let prev = self.average_run_burst_ewma.as_micros();
        let sample = burst.as_micros();
        let updated = (prev * (256 - alpha) + sample * alpha) / 256;
        self.average_run_burst_ewma = Duration::from_micros(updated);
        self.voluntary_sleep_transitions = self.voluntary_sleep_transitions.saturating_add(1);
        self.time_used_in_current_quantum = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thread() -> ThreadRecord {
        ThreadRecord::new(config::priority::LOWEST_ACTIVE, 0, None)
    }

    // ===== identity / policy =====

    #[test]
    fn new_thread_starts_created_and_not_enqueued() {
        let t = thread();
        assert_eq!(t.state, ThreadState::Created);
        assert!(!t.enqueued);
    }

    #[test]
    fn idle_thread_is_never_real_time_and_has_minimal_weight() {
        let t = ThreadRecord::new_idle();
        assert!(t.is_idle);
        assert!(!t.is_real_time());
        assert_eq!(t.weight, 1);
    }

    #[test]
    fn rt_priority_yields_rt_classification_and_max_weight() {
        let mut t = thread();
        t.base_priority = config::priority::RT_BAND;
        t.recompute_priority();
        assert!(t.is_real_time());
        assert_eq!(t.weight, u32::MAX / 2);
    }

    // ===== affinity =====

    #[test]
    fn pinned_cpu_overrides_mask() {
        let mut t = thread();
        t.cpu_mask = CpuMask::single(CpuId::new(2));
        t.pinned_cpu = Some(CpuId::new(5));
        assert!(t.can_run_on(CpuId::new(5)));
        assert!(!t.can_run_on(CpuId::new(2)));
    }

    #[test]
    fn mask_governs_affinity_without_pin() {
        let mut t = thread();
        t.cpu_mask = CpuMask::single(CpuId::new(3));
        assert!(t.can_run_on(CpuId::new(3)));
        assert!(!t.can_run_on(CpuId::new(4)));
    }

    // ===== affinitized IRQs =====

    #[test]
    fn affinitized_irqs_are_bounded_and_deduplicated() {
        let mut t = thread();
        for i in 0..config::MAX_AFFINITIZED_IRQS {
            t.add_affinitized_irq(IrqId(i as u32)).unwrap();
        }
        // duplicate is a no-op, not an overflow
        assert!(t.add_affinitized_irq(IrqId(0)).is_ok());
        assert_eq!(t.affinitized_irqs.len(), config::MAX_AFFINITIZED_IRQS);
        // list is full; a genuinely new IRQ is rejected
        assert!(t.add_affinitized_irq(IrqId(999)).is_err());
    }

    #[test]
    fn remove_affinitized_irq_is_idempotent() {
        let mut t = thread();
        t.add_affinitized_irq(IrqId(7)).unwrap();
        t.remove_affinitized_irq(IrqId(7));
        t.remove_affinitized_irq(IrqId(7));
        assert!(t.affinitized_irqs.is_empty());
    }

    // ===== voluntary sleep accounting =====

    #[test]
    fn voluntary_sleep_bumps_transition_count_and_resets_quantum_scratch() {
        let mut t = thread();
        t.time_used_in_current_quantum = Duration::from_micros(400);
        t.record_voluntary_sleep(Duration::from_micros(500));
        assert_eq!(t.voluntary_sleep_transitions, 1);
        assert_eq!(t.time_used_in_current_quantum, Duration::ZERO);
    }
}
