//! Per-CPU scheduler record (spec §3.3).
//!
//! Cache-line-sized per-CPU state: the run queue, load accounting,
//! and balancing/stealing cooldown timestamps. Grounded on the
//! teacher's `#[repr(C, align(64))] PerCpuSchedData`
//! (`scheduler/percpu.rs`), generalized from its fixed
//! `[Option<RunQueueEntry>; PERCPU_RQ_SIZE]` array to the indexed
//! binary heap in [`crate::runqueue`].

use core::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;

use crate::arena::{CoreId, CpuId, TeamId, ThreadId};
use crate::runqueue::RunQueue;
use crate::time::Instant;

/// Per-CPU scheduling state. `#[repr(C)]` to keep the hot fields
/// (queue lock, task count) from sharing a cache line with
/// infrequently-touched ones in an embedder's array of these.
#[repr(C)]
pub struct PerCpuRecord {
    pub cpu_number: CpuId,
    pub core: CoreId,
    pub idle_thread: ThreadId,

    pub run_queue: Mutex<RunQueue>,
    run_queue_task_count: AtomicUsize,

    min_virtual_runtime: AtomicI64,

    /// Team selected by the tier-1 team picker (external
    /// collaborator); `None` if no team is currently active on this
    /// CPU (spec §4.4).
    current_active_team: Mutex<Option<TeamId>>,

    /// `[0, MAX_LOAD]` fixed-point EWMA of self-utilization.
    instantaneous_load: AtomicU32,
    /// `[0, MAX_LOAD]` decaying long-window average.
    long_window_load: AtomicU32,

    measure_active_time_us: AtomicU32,
    measure_time_us: AtomicU32,

    next_steal_attempt_time: Mutex<Instant>,
    last_time_task_stolen_from: Mutex<Instant>,

    smt_aware_heap_key: AtomicU32,

    /// Set when load accounting has new data a reader hasn't
    /// consumed yet; cleared by `load.rs` after recomputing the
    /// core's aggregate.
    update_load_pending: core::sync::atomic::AtomicBool,
}

impl PerCpuRecord {
    pub fn new(cpu_number: CpuId, core: CoreId, idle_thread: ThreadId) -> Self {
        PerCpuRecord {
            cpu_number,
            core,
            idle_thread,
            run_queue: Mutex::new(RunQueue::new()),
            run_queue_task_count: AtomicUsize::new(0),
            min_virtual_runtime: AtomicI64::new(0),
            current_active_team: Mutex::new(None),
            instantaneous_load: AtomicU32::new(0),
            long_window_load: AtomicU32::new(0),
            measure_active_time_us: AtomicU32::new(0),
            measure_time_us: AtomicU32::new(0),
            next_steal_attempt_time: Mutex::new(Instant::ZERO),
            last_time_task_stolen_from: Mutex::new(Instant::ZERO),
            smt_aware_heap_key: AtomicU32::new(0),
            update_load_pending: core::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn task_count(&self) -> usize {
        self.run_queue_task_count.load(Ordering::Acquire)
    }

    pub fn set_task_count(&self, count: usize) {
        self.run_queue_task_count.store(count, Ordering::Release);
    }

    pub fn sync_task_count(&self) {
        let count = self.run_queue.lock().count();
        self.set_task_count(count);
    }

    pub fn min_virtual_runtime(&self) -> i64 {
        self.min_virtual_runtime.load(Ordering::Acquire)
    }

    /// Advances the cached minimum; per spec §4.1 notes on `min_vruntime`,
    /// it only ever increases.
    pub fn advance_min_virtual_runtime(&self, candidate: i64) {
        self.min_virtual_runtime.fetch_max(candidate, Ordering::AcqRel);
    }

    pub fn active_team(&self) -> Option<TeamId> {
        *self.current_active_team.lock()
    }

    pub fn set_active_team(&self, team: Option<TeamId>) {
        *self.current_active_team.lock() = team;
    }

    pub fn instantaneous_load(&self) -> u32 {
        self.instantaneous_load.load(Ordering::Acquire)
    }

    pub fn set_instantaneous_load(&self, value: u32) {
        self.instantaneous_load.store(value, Ordering::Release);
        self.update_load_pending.store(true, Ordering::Release);
    }

    pub fn take_update_load_pending(&self) -> bool {
        self.update_load_pending.swap(false, Ordering::AcqRel)
    }

    pub fn long_window_load(&self) -> u32 {
        self.long_window_load.load(Ordering::Acquire)
    }

    pub fn set_long_window_load(&self, value: u32) {
        self.long_window_load.store(value, Ordering::Release);
    }

    pub fn record_active(&self, active_us: u32, elapsed_us: u32) {
        self.measure_active_time_us.fetch_add(active_us, Ordering::AcqRel);
        self.measure_time_us.fetch_add(elapsed_us, Ordering::AcqRel);
    }

    pub fn measured_window(&self) -> (u32, u32) {
        (self.measure_active_time_us.load(Ordering::Acquire), self.measure_time_us.load(Ordering::Acquire))
    }

    pub fn reset_measurement_window(&self) {
        self.measure_active_time_us.store(0, Ordering::Release);
        self.measure_time_us.store(0, Ordering::Release);
    }

    pub fn next_steal_attempt_time(&self) -> Instant {
        *self.next_steal_attempt_time.lock()
    }

    pub fn set_next_steal_attempt_time(&self, t: Instant) {
        *self.next_steal_attempt_time.lock() = t;
    }

    pub fn last_time_task_stolen_from(&self) -> Instant {
        *self.last_time_task_stolen_from.lock()
    }

    pub fn set_last_time_task_stolen_from(&self, t: Instant) {
        *self.last_time_task_stolen_from.lock() = t;
    }

    pub fn smt_aware_heap_key(&self) -> u32 {
        self.smt_aware_heap_key.load(Ordering::Acquire)
    }

    pub fn set_smt_aware_heap_key(&self, key: u32) {
        self.smt_aware_heap_key.store(key, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn percpu() -> PerCpuRecord {
        PerCpuRecord::new(CpuId::new(0), CoreId::new(0), ThreadId::new(0))
    }

    #[test]
    fn min_vruntime_only_increases() {
        let p = percpu();
        p.advance_min_virtual_runtime(100);
        p.advance_min_virtual_runtime(50);
        assert_eq!(p.min_virtual_runtime(), 100);
        p.advance_min_virtual_runtime(200);
        assert_eq!(p.min_virtual_runtime(), 200);
    }

    #[test]
    fn task_count_syncs_with_queue() {
        let p = percpu();
        p.run_queue.lock().add(ThreadId::new(1), Instant::from_micros(10)).unwrap();
        p.sync_task_count();
        assert_eq!(p.task_count(), 1);
    }

    #[test]
    fn setting_load_flags_pending_update() {
        let p = percpu();
        assert!(!p.take_update_load_pending());
        p.set_instantaneous_load(500);
        assert!(p.take_update_load_pending());
        assert!(!p.take_update_load_pending());
    }

    #[test]
    fn active_team_defaults_to_none() {
        let p = percpu();
        assert_eq!(p.active_team(), None);
        p.set_active_team(Some(TeamId::new(3)));
        assert_eq!(p.active_team(), Some(TeamId::new(3)));
    }
}
