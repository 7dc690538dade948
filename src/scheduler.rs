//! Top-level scheduler object: owns every arena and per-CPU record and
//! exposes the external API (spec §6) an embedding kernel calls.
//!
//! Grounded on the teacher's top-level `Scheduler` in `scheduler/mod.rs`,
//! which owns the same constellation of arenas/per-CPU arrays and
//! exposes an equivalent `on_*` entry-point surface; this module
//! generalizes it to the two-tier team/EEVDF dispatch, heterogeneous
//! placement, and IRQ routing this crate adds.

use alloc::boxed::Box;
use alloc::vec::Vec;

use core::sync::atomic::{AtomicI64, Ordering};

use spin::Mutex;

use crate::arena::{Arena, CoreId, CpuId, PackageId, TeamId, ThreadId};
use crate::balance::{self, MigrationCandidate};
use crate::config::{
    BALANCE_INTERVAL_DEFAULT, BALANCE_INTERVAL_MAX, BALANCE_INTERVAL_MIN, BALANCE_SAMPLE_SIZE,
    LOAD_REHEAP_DELTA, STEAL_FAILURE_BACKOFF, STEAL_SUCCESS_COOLDOWN, VICTIM_COOLDOWN,
};
use crate::contract_violation;
use crate::cpu_mask::CpuMask;
use crate::dispatch::{self, ChosenThread, ThreadDispatchInfo};
use crate::eevdf::{self, PlacementContext};
use crate::error::{SchedError, SchedResult};
use crate::irq::{self, IrqAffinityMap, IrqCandidate, IrqId};
use crate::load::{self, ShardedCoreHeaps};
use crate::percpu::PerCpuRecord;
use crate::placement::{self, PlacementMode};
use crate::stats::CpuStats;
use crate::team::TeamRecord;
use crate::thread::{ThreadRecord, ThreadState};
use crate::time::{Duration, Instant};
use crate::topology::{CoreType, Topology};

/// Per-CPU periodic-balancer bookkeeping: adaptive interval between
/// `[BALANCE_INTERVAL_MIN, BALANCE_INTERVAL_MAX]`, widened on a quiet
/// CPU and reset to the default after a migration (§4.7).
struct BalanceState {
    next_balance_at: Instant,
    interval: Duration,
}

impl BalanceState {
    fn new() -> Self {
        BalanceState { next_balance_at: Instant::ZERO, interval: BALANCE_INTERVAL_DEFAULT }
    }
}

/// The scheduling engine. One instance serves an entire machine; the
/// embedder is responsible for routing per-CPU calls (`on_tick`, etc.)
/// to the CPU they actually occurred on.
pub struct Scheduler {
    pub topology: Topology,
    threads: Arena<ThreadRecord>,
    teams: Arena<TeamRecord>,
    percpu: Vec<PerCpuRecord>,
    stats: Vec<CpuStats>,
    balance_state: Vec<Mutex<BalanceState>>,
    loads: ShardedCoreHeaps,
    irq_affinity: Mutex<IrqAffinityMap>,
    mode: Box<dyn PlacementMode>,
    quota_period: Duration,
    global_min_vruntime: AtomicI64,
}

impl Scheduler {
    pub fn new(mode: Box<dyn PlacementMode>, quota_period: Duration) -> Self {
        Scheduler {
            topology: Topology::new(),
            threads: Arena::new(),
            teams: Arena::new(),
            percpu: Vec::new(),
            stats: Vec::new(),
            balance_state: Vec::new(),
            loads: ShardedCoreHeaps::new(),
            irq_affinity: Mutex::new(IrqAffinityMap::new()),
            mode,
            quota_period,
            global_min_vruntime: AtomicI64::new(0),
        }
    }

    // ===== topology construction =====

    pub fn add_package(&mut self) -> PackageId {
        self.topology.add_package()
    }

    pub fn add_core(&mut self, package: PackageId, core_type: CoreType, performance_capacity: u32, energy_efficiency: u32) -> CoreId {
        self.topology.add_core(package, core_type, performance_capacity, energy_efficiency)
    }

    /// Adds a logical CPU to `core`, allocating its per-CPU record and
    /// synthetic idle thread. CPU indices are assigned sequentially and
    /// must line up 1:1 with `percpu`'s length; this crate never frees
    /// a `CpuId` slot (spec §1: CPU hot-remove is out of scope, only
    /// enable/disable).
    pub fn add_cpu(&mut self, core: CoreId) -> CpuId {
        let cpu = self.topology.add_cpu(core);
        let idle_idx = self.threads.insert(ThreadRecord::new_idle());
        let idle_id = ThreadId::new(idle_idx as usize);
        debug_assert_eq!(self.percpu.len(), cpu.index());
        self.percpu.push(PerCpuRecord::new(cpu, core, idle_id));
        self.stats.push(CpuStats::new());
        self.balance_state.push(Mutex::new(BalanceState::new()));
        cpu
    }

    // ===== thread / team lifecycle =====

    pub fn spawn_thread(&mut self, base_priority: i32, latency_nice: i32, team: Option<TeamId>) -> ThreadId {
        let mut record = ThreadRecord::new(base_priority, latency_nice, team);
        record.recompute_priority();
        let idx = self.threads.insert(record);
        ThreadId::new(idx as usize)
    }

    pub fn spawn_team(&mut self, cpu_quota_percent: u32) -> TeamId {
        let mut team = TeamRecord::new(cpu_quota_percent);
        team.start_new_period(self.quota_period);
        let idx = self.teams.insert(team);
        TeamId::new(idx as usize)
    }

    pub fn thread(&self, id: ThreadId) -> Option<&ThreadRecord> {
        self.threads.get(id.index() as u32)
    }

    pub fn team(&self, id: TeamId) -> Option<&TeamRecord> {
        self.teams.get(id.index() as u32)
    }

    pub fn percpu(&self, cpu: CpuId) -> &PerCpuRecord {
        &self.percpu[cpu.index()]
    }

    pub fn stats(&self, cpu: CpuId) -> &CpuStats {
        &self.stats[cpu.index()]
    }

    fn capacity_of(&self, core: CoreId) -> u32 {
        self.topology.core(core).map(|c| c.performance_capacity).unwrap_or(crate::config::NOMINAL_CAPACITY)
    }

    fn placement_context_for(&self, cpu: CpuId) -> PlacementContext {
        let core = self.percpu[cpu.index()].core;
        PlacementContext {
            capacity: Some(self.capacity_of(core)),
            context_min_vruntime: Some(self.percpu[cpu.index()].min_virtual_runtime()),
            global_min_vruntime: self.global_min_vruntime.load(Ordering::Acquire),
            queue_depth: self.percpu[cpu.index()].task_count(),
        }
    }

    fn dispatch_info_of(&self, thread: ThreadId) -> ThreadDispatchInfo {
        match self.thread(thread) {
            Some(t) => ThreadDispatchInfo { team: t.team, is_real_time: t.is_real_time(), eligible_time: t.eligible_time },
            None => contract_violation!("dispatch info requested for an unknown thread"),
        }
    }

    fn team_quota_exhausted(&self, team: TeamId) -> bool {
        self.team(team).map(|t| t.quota_exhausted).unwrap_or(false)
    }

    // ===== state-machine entry points (spec §4.10) =====

    /// `CREATED -> READY` (first placement) or a re-placement of an
    /// already-placed thread (e.g. after an affinity change). Computes
    /// EEVDF parameters as a new-or-relocated thread and enqueues it on
    /// the chosen CPU.
    pub fn on_thread_enqueue(&mut self, thread_id: ThreadId, now: Instant) -> SchedResult<CpuId> {
        if !self.threads.contains(thread_id.index() as u32) {
            return Err(SchedError::ContractViolation("enqueue of an unknown thread"));
        }

        let (core_hint, cpu_hint, needed_load) = {
            let t = self.threads.get(thread_id.index() as u32).unwrap();
            (t.home_core, t.pinned_cpu, t.needed_load)
        };

        let thread = self.threads.get_mut(thread_id.index() as u32).unwrap();
        let placement = placement::choose_core_and_cpu(
            thread,
            self.mode.as_ref(),
            &self.topology,
            &self.loads,
            core_hint,
            cpu_hint,
            now,
            |cpu| self.percpu[cpu.index()].instantaneous_load(),
            |cpu| self.percpu[cpu.index()].task_count(),
        )?;

        if placement.migrated {
            if let Some(old_core) = core_hint {
                self.topology.remove_needed_load(old_core, needed_load);
            }
            self.topology.add_needed_load(placement.core, needed_load);
        }

        let ctx = self.placement_context_for(placement.cpu);
        let thread = self.threads.get_mut(thread_id.index() as u32).unwrap();
        eevdf::compute_params(thread, &ctx, true, false, now);
        thread.state = ThreadState::Ready;
        thread.enqueued = true;
        thread.quantum_start_wall = now;

        let percpu = &self.percpu[placement.cpu.index()];
        percpu.run_queue.lock().add(thread_id, thread.virtual_deadline)?;
        percpu.sync_task_count();

        Ok(placement.cpu)
    }

    /// `BLOCKED -> READY`: same as enqueue but the thread already has a
    /// `home_core`/`previous_cpu`, so affinity-compatible hints are
    /// honored (cache-warm preference, §4.8) rather than re-placing
    /// from scratch.
    pub fn on_thread_wake(&mut self, thread_id: ThreadId, now: Instant) -> SchedResult<CpuId> {
        self.on_thread_enqueue(thread_id, now)
    }

    /// `RUNNING -> BLOCKED` (voluntary) or `RUNNING -> READY`
    /// (preempted/yielded, `voluntary == false`). Removes the thread
    /// from its run queue if still enqueued and charges the elapsed
    /// active time against its EEVDF parameters.
    pub fn on_thread_sleep(&mut self, thread_id: ThreadId, cpu: CpuId, voluntary: bool, now: Instant) -> SchedResult<()> {
        let capacity = self.capacity_of(self.percpu[cpu.index()].core);
        let thread = self
            .threads
            .get_mut(thread_id.index() as u32)
            .ok_or(SchedError::ContractViolation("sleep of an unknown thread"))?;

        let active = now.saturating_since(thread.quantum_start_wall);
        eevdf::account_active_time(thread, active, capacity);
        eevdf::update_needed_load(thread, active);

        if thread.enqueued {
            self.percpu[cpu.index()].run_queue.lock().remove(thread_id)?;
            self.percpu[cpu.index()].sync_task_count();
            thread.enqueued = false;
        }

        if voluntary {
            thread.record_voluntary_sleep(active);
            thread.state = ThreadState::Blocked;
            self.stats[cpu.index()].record_context_switch(true);
        } else {
            thread.state = ThreadState::Ready;
        }

        Ok(())
    }

    /// `* -> EXITING`: removes the thread from its run queue if present
    /// and frees its arena slot.
    pub fn on_thread_exit(&mut self, thread_id: ThreadId, cpu: Option<CpuId>) -> SchedResult<()> {
        if let Some(cpu) = cpu {
            let enqueued = self.threads.get(thread_id.index() as u32).map(|t| t.enqueued).unwrap_or(false);
            if enqueued {
                self.percpu[cpu.index()].run_queue.lock().remove(thread_id)?;
                self.percpu[cpu.index()].sync_task_count();
            }
        }
        if let Some(t) = self.threads.get(thread_id.index() as u32) {
            if let Some(home_core) = t.home_core {
                self.topology.remove_needed_load(home_core, t.needed_load);
            }
        }
        self.threads
            .remove(thread_id.index() as u32)
            .map(|_| ())
            .ok_or(SchedError::ContractViolation("exit of an unknown thread"))
    }

    // ===== dispatch =====

    /// Runs one dispatch decision on `cpu` (§4.2), accounting the
    /// outgoing thread's active time and requeueing it first if it is
    /// still ready (step 1 of §4.2, "the previously running thread is
    /// requeued before the scan if it has not blocked or exited").
    pub fn on_tick(&mut self, cpu: CpuId, running: Option<ThreadId>, now: Instant) -> SchedResult<ChosenThread> {
        let core = self.percpu[cpu.index()].core;
        let capacity = self.capacity_of(core);
        let ctx = self.placement_context_for(cpu);

        if let Some(running_id) = running {
            let thread = self
                .threads
                .get_mut(running_id.index() as u32)
                .ok_or(SchedError::ContractViolation("tick with an unknown running thread"))?;

            // The synthetic idle thread is never enqueued (§3.1): it has
            // no EEVDF parameters to recompute and nothing to requeue.
            if !thread.is_idle {
                let active = now.saturating_since(thread.quantum_start_wall);
                eevdf::account_active_time(thread, active, capacity);
                eevdf::update_needed_load(thread, active);
                if let Some(team_id) = thread.team {
                    if let Some(team) = self.teams.get_mut(team_id.index() as u32) {
                        team.account_active_time(active);
                    }
                }

                eevdf::compute_params(thread, &ctx, false, true, now);
                thread.quantum_start_wall = now;
                thread.enqueued = true;
                self.percpu[cpu.index()].run_queue.lock().add(running_id, thread.virtual_deadline)?;
            }
        }

        self.percpu[cpu.index()].sync_task_count();

        let mut chosen = self.dispatch_once(cpu, now)?;
        if matches!(chosen, ChosenThread::Idle) && self.try_steal(cpu, now) {
            chosen = self.dispatch_once(cpu, now)?;
        }

        self.maybe_balance(cpu, now);

        Ok(chosen)
    }

    /// One run-queue scan and, if a thread was chosen, the
    /// `READY -> RUNNING` transition bookkeeping (§4.2, §4.10). Split
    /// out of `on_tick` so a successful opportunistic steal can trigger
    /// a second scan without re-running the outgoing-thread accounting.
    fn dispatch_once(&mut self, cpu: CpuId, now: Instant) -> SchedResult<ChosenThread> {
        let active_team = self.percpu[cpu.index()].active_team();
        let chosen = {
            let mut queue = self.percpu[cpu.index()].run_queue.lock();
            dispatch::choose_next_thread(
                &mut queue,
                active_team,
                |team| self.team_quota_exhausted(team),
                |t| self.dispatch_info_of(t),
                now,
            )
        };
        self.percpu[cpu.index()].sync_task_count();

        if let ChosenThread::Found(thread_id) = chosen {
            let thread = self.threads.get_mut(thread_id.index() as u32).unwrap();
            self.percpu[cpu.index()].run_queue.lock().remove(thread_id)?;
            self.percpu[cpu.index()].sync_task_count();
            thread.state = ThreadState::Running;
            thread.enqueued = false;
            thread.quantum_start_wall = now;
            let team = thread.team;
            let vruntime = thread.virtual_runtime;
            if let Some(team) = team {
                self.percpu[cpu.index()].set_active_team(Some(team));
            }
            self.percpu[cpu.index()].advance_min_virtual_runtime(vruntime);
            self.global_min_vruntime.fetch_max(vruntime, Ordering::AcqRel);
            self.stats[cpu.index()].record_context_switch(false);
        }

        Ok(chosen)
    }

    /// An IPI-driven immediate reschedule request; equivalent to
    /// `on_tick` with no outgoing thread (the caller has already
    /// stopped the running thread through other means, e.g. a
    /// voluntary sleep already reported via `on_thread_sleep`).
    pub fn on_reschedule_request(&mut self, cpu: CpuId, now: Instant) -> SchedResult<ChosenThread> {
        self.on_tick(cpu, None, now)
    }

    // ===== policy mutation (spec §6) =====

    pub fn set_thread_priority(&mut self, thread_id: ThreadId, base_priority: i32) -> SchedResult<()> {
        let thread = self.threads.get_mut(thread_id.index() as u32).ok_or(SchedError::ContractViolation("unknown thread"))?;
        thread.base_priority = base_priority;
        thread.recompute_priority();
        Ok(())
    }

    pub fn set_thread_latency_nice(&mut self, thread_id: ThreadId, latency_nice: i32) -> SchedResult<()> {
        let thread = self.threads.get_mut(thread_id.index() as u32).ok_or(SchedError::ContractViolation("unknown thread"))?;
        thread.latency_nice = latency_nice.clamp(-20, 19);
        Ok(())
    }

    pub fn set_thread_affinity(&mut self, thread_id: ThreadId, mask: CpuMask) -> SchedResult<()> {
        let thread = self.threads.get_mut(thread_id.index() as u32).ok_or(SchedError::ContractViolation("unknown thread"))?;
        thread.cpu_mask = mask;
        if let Some(prev) = thread.previous_cpu {
            if !mask.is_set(prev) {
                thread.previous_cpu = None;
                thread.home_core = None;
            }
        }
        Ok(())
    }

    pub fn set_cpu_enabled(&mut self, cpu: CpuId, enabled: bool) {
        self.topology.set_cpu_enabled(cpu, enabled);
    }

    pub fn set_team_quota(&mut self, team_id: TeamId, cpu_quota_percent: u32) -> SchedResult<()> {
        let team = self.teams.get_mut(team_id.index() as u32).ok_or(SchedError::ContractViolation("unknown team"))?;
        team.cpu_quota_percent = cpu_quota_percent;
        Ok(())
    }

    /// Embedder-driven quota-period boundary callback (§4.4); the core
    /// never times this itself (`TeamProvider::on_quota_period_boundary`
    /// in `collab.rs` is the hook a kernel actually wires up).
    pub fn on_quota_period_boundary(&mut self, team_id: TeamId) -> SchedResult<()> {
        let team = self.teams.get_mut(team_id.index() as u32).ok_or(SchedError::ContractViolation("unknown team"))?;
        team.start_new_period(self.quota_period);
        Ok(())
    }

    // ===== periodic load balancing and work stealing (spec §4.7) =====

    /// Runs the periodic balancer on `cpu` if its adaptive interval has
    /// elapsed, widening the interval on a quiet pass and resetting it
    /// to the default after a successful migration. This is the
    /// timer-driven mechanism of §4.7's two complementary ones; it runs
    /// unconditionally on the interval, independent of whether `cpu`'s
    /// own queue is empty (that case is `try_steal`'s job instead).
    fn maybe_balance(&mut self, cpu: CpuId, now: Instant) {
        let due = {
            let state = self.balance_state[cpu.index()].lock();
            now >= state.next_balance_at
        };
        if !due {
            return;
        }

        let migrated = self.periodic_balance(cpu, now);

        let mut state = self.balance_state[cpu.index()].lock();
        state.interval = if migrated {
            BALANCE_INTERVAL_DEFAULT
        } else {
            Duration::from_micros((state.interval.as_micros() * 2).min(BALANCE_INTERVAL_MAX.as_micros())).clamp(BALANCE_INTERVAL_MIN, BALANCE_INTERVAL_MAX)
        };
        state.next_balance_at = now.saturating_add(state.interval);
    }

    /// Periodic load balancer (§4.7): samples up to
    /// [`BALANCE_SAMPLE_SIZE`] threads off the most-loaded core whose
    /// load exceeds `cpu`'s own core by more than [`LOAD_REHEAP_DELTA`]
    /// and migrates the first one `balance::select_migration_candidate`
    /// accepts, returning the rest untouched.
    fn periodic_balance(&mut self, cpu: CpuId, now: Instant) -> bool {
        let destination_core = self.percpu[cpu.index()].core;
        let destination_load = self.topology.core(destination_core).map(|c| c.load).unwrap_or(0);

        let source_core = match self.loads.high_load_cores().into_iter().find(|&c| c != destination_core) {
            Some(c) => c,
            None => return false,
        };
        let source_load = self.topology.core(source_core).map(|c| c.load).unwrap_or(0);
        if source_load <= destination_load.saturating_add(LOAD_REHEAP_DELTA) {
            return false;
        }

        let source_cpu = match self.topology.cpus_on_core(source_core).next() {
            Some(c) => c,
            None => return false,
        };

        let sampled: Vec<(ThreadId, Instant)> = self.percpu[source_cpu.index()].run_queue.lock().pop_multiple(BALANCE_SAMPLE_SIZE);
        self.percpu[source_cpu.index()].sync_task_count();
        if sampled.is_empty() {
            return false;
        }

        let candidates: Vec<MigrationCandidate> = sampled
            .iter()
            .filter_map(|(tid, _)| {
                let t = self.threads.get(tid.index() as u32)?;
                Some(MigrationCandidate {
                    thread: *tid,
                    affinity: t.cpu_mask,
                    last_migration_time: t.last_migration_time,
                    lag: t.lag,
                    is_real_time_pinned_to_source: t.is_real_time() && t.pinned_cpu == Some(source_cpu),
                })
            })
            .collect();

        let chosen = balance::select_migration_candidate(candidates, cpu, now);

        // Put back everything we didn't migrate before touching anything else.
        let leftovers: Vec<(ThreadId, Instant)> = sampled.iter().copied().filter(|(tid, _)| Some(*tid) != chosen).collect();
        self.percpu[source_cpu.index()].run_queue.lock().add_batch(leftovers).ok();
        self.percpu[source_cpu.index()].sync_task_count();

        let Some(thread_id) = chosen else { return false };
        let deadline = sampled.iter().find(|(tid, _)| *tid == thread_id).map(|(_, d)| *d).unwrap();

        let needed_load = {
            let thread = self.threads.get_mut(thread_id.index() as u32).unwrap();
            thread.home_core = Some(destination_core);
            thread.previous_cpu = Some(cpu);
            thread.last_migration_time = now;
            thread.migration_count = thread.migration_count.saturating_add(1);
            thread.needed_load
        };
        self.percpu[cpu.index()].run_queue.lock().add_batch([(thread_id, deadline)]).ok();
        self.percpu[cpu.index()].sync_task_count();

        self.topology.remove_needed_load(source_core, needed_load);
        self.topology.add_needed_load(destination_core, needed_load);

        self.stats[cpu.index()].record_migration_in();
        self.stats[source_cpu.index()].record_migration_out();
        true
    }

    /// Opportunistic work stealing (§4.7): gated on `cpu`'s own run
    /// queue being empty, right before it would otherwise idle. Scans
    /// victims in locality-graduated order — SMT siblings first, then
    /// the rest of the package, then globally the busiest core.
    fn try_steal(&mut self, cpu: CpuId, now: Instant) -> bool {
        if !self.percpu[cpu.index()].run_queue.lock().is_empty() {
            return false;
        }
        if now < self.percpu[cpu.index()].next_steal_attempt_time() {
            return false;
        }

        let own_core = self.percpu[cpu.index()].core;
        let package = self.topology.core(own_core).map(|c| c.package);

        let mut victim_cpus: Vec<CpuId> = self.topology.siblings_of(cpu).collect();

        if victim_cpus.is_empty() {
            if let Some(pkg) = package {
                let sibling_cores: Vec<CoreId> =
                    self.topology.package(pkg).map(|p| p.cores.iter().copied().filter(|&c| c != own_core).collect()).unwrap_or_default();
                victim_cpus = sibling_cores.into_iter().flat_map(|c| self.topology.cpus_on_core(c).collect::<Vec<_>>()).collect();
            }
        }

        if victim_cpus.is_empty() {
            if let Some(core) = self.loads.max_loaded().filter(|&c| c != own_core) {
                victim_cpus = self.topology.cpus_on_core(core).collect();
            }
        }

        for victim_cpu in victim_cpus {
            if self.try_steal_from(cpu, victim_cpu, now) {
                return true;
            }
        }

        self.percpu[cpu.index()].set_next_steal_attempt_time(now.saturating_add(STEAL_FAILURE_BACKOFF));
        self.stats[cpu.index()].record_steal_outcome(false);
        false
    }

    /// Attempts to steal one tail candidate from `victim_cpu`'s run
    /// queue for `thief_cpu`, subject to victim cooldown and
    /// `balance::find_steal_candidate`'s bounded scan.
    fn try_steal_from(&mut self, thief_cpu: CpuId, victim_cpu: CpuId, now: Instant) -> bool {
        if victim_cpu == thief_cpu {
            return false;
        }
        if !balance::can_steal_from_victim(self.percpu[victim_cpu.index()].last_time_task_stolen_from(), now, VICTIM_COOLDOWN) {
            return false;
        }

        let tail: Vec<MigrationCandidate> = {
            let queue = self.percpu[victim_cpu.index()].run_queue.lock();
            queue
                .iter()
                .filter_map(|(tid, _)| {
                    let t = self.threads.get(tid.index() as u32)?;
                    Some(MigrationCandidate {
                        thread: tid,
                        affinity: t.cpu_mask,
                        last_migration_time: t.last_migration_time,
                        lag: t.lag,
                        is_real_time_pinned_to_source: t.is_real_time() && t.pinned_cpu == Some(victim_cpu),
                    })
                })
                .collect()
        };

        let Some(thread_id) = balance::find_steal_candidate(&tail, thief_cpu, now) else {
            return false;
        };

        let deadline = match self.percpu[victim_cpu.index()].run_queue.lock().remove(thread_id) {
            Ok(d) => d,
            Err(_) => return false,
        };
        self.percpu[victim_cpu.index()].sync_task_count();

        let thief_core = self.percpu[thief_cpu.index()].core;
        let victim_core = self.percpu[victim_cpu.index()].core;
        let needed_load = if let Some(t) = self.threads.get_mut(thread_id.index() as u32) {
            t.home_core = Some(thief_core);
            t.previous_cpu = Some(thief_cpu);
            t.last_migration_time = now;
            t.migration_count = t.migration_count.saturating_add(1);
            t.needed_load
        } else {
            0
        };
        self.percpu[thief_cpu.index()].run_queue.lock().add(thread_id, deadline).ok();
        self.percpu[thief_cpu.index()].sync_task_count();

        if victim_core != thief_core {
            self.topology.remove_needed_load(victim_core, needed_load);
            self.topology.add_needed_load(thief_core, needed_load);
        }

        self.percpu[thief_cpu.index()].set_next_steal_attempt_time(now.saturating_add(STEAL_SUCCESS_COOLDOWN));
        self.percpu[victim_cpu.index()].set_last_time_task_stolen_from(now);
        self.stats[thief_cpu.index()].record_migration_in();
        self.stats[victim_cpu.index()].record_migration_out();
        self.stats[thief_cpu.index()].record_steal_outcome(true);
        true
    }

    // ===== load accounting (spec §4.5) =====

    /// Recomputes `instantaneous_load`/`long_window_load` for `cpu`
    /// from its measured active/elapsed window and re-keys the core's
    /// entry in the sharded load heaps if the change is significant.
    pub fn recompute_load(&mut self, cpu: CpuId) {
        let percpu = &self.percpu[cpu.index()];
        let (active_us, elapsed_us) = percpu.measured_window();
        if elapsed_us == 0 {
            return;
        }
        let sample = ((active_us as u64 * crate::config::MAX_LOAD as u64) / elapsed_us as u64).min(crate::config::MAX_LOAD as u64) as u32;
        let new_instant = load::update_instantaneous_load(percpu.instantaneous_load(), sample);
        percpu.set_instantaneous_load(new_instant);
        let new_long = load::ewma_update(percpu.long_window_load(), sample, crate::config::INSTANT_LOAD_EWMA_ALPHA / 4);
        percpu.set_long_window_load(new_long);
        percpu.reset_measurement_window();

        let core_id = percpu.core;
        let siblings_load: Vec<u32> = self.topology.cpus_on_core(core_id).map(|c| self.percpu[c.index()].long_window_load()).collect();
        let aggregate = load::aggregate_core_load(siblings_load.into_iter());
        if let Some(core) = self.topology.core_mut(core_id) {
            let old = core.load;
            core.load = aggregate;
            core.high_load = aggregate >= crate::config::HIGH_LOAD_THRESHOLD;
            if load::needs_reheap(old, aggregate) {
                self.loads.set_load(core_id, Some(old), aggregate);
            }
        }
    }

    // ===== IRQ routing (spec §4.9, §6) =====

    pub fn set_irq_task_affinity(&mut self, irq: IrqId, thread_id: ThreadId) -> SchedResult<()> {
        let thread = self.threads.get_mut(thread_id.index() as u32).ok_or(SchedError::ContractViolation("unknown thread"))?;
        thread.add_affinitized_irq(irq)?;
        self.irq_affinity.lock().set(irq, thread_id);
        Ok(())
    }

    /// `select_target_cpu_for_irq` (§4.9): picks the best CPU on `core`
    /// to service `irq`, given each candidate CPU's current load.
    /// `running_on` lets the caller supply which thread (if any) is
    /// currently running on each candidate CPU, for the colocation
    /// bonus; this crate does not track that mapping itself (spec §6,
    /// `PerCpuContext::running_thread`).
    pub fn select_target_cpu_for_irq(&self, core: CoreId, irq: IrqId, irq_load: u32, base_mode_cap: u32, running_on: impl Fn(CpuId) -> Option<ThreadId>) -> Option<CpuId> {
        let candidates: Vec<IrqCandidate> = self
            .topology
            .cpus_on_core(core)
            .filter(|c| self.topology.cpu(*c).map(|r| r.enabled).unwrap_or(false))
            .map(|cpu| {
                let own = self.percpu[cpu.index()].instantaneous_load();
                let siblings = self.topology.siblings_of(cpu).map(|c| self.percpu[c.index()].instantaneous_load());
                let smt_penalty = placement::effective_smt_load(0, siblings).min(own);
                IrqCandidate { cpu, instant_load: own, smt_penalty, existing_irq_load: 0 }
            })
            .collect();

        let affinity = self.irq_affinity.lock();
        irq::select_target_cpu_for_irq(&self.topology, &affinity, core, irq, irq_load, &candidates, base_mode_cap, running_on)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::PerformanceMode;

    fn single_core_scheduler() -> (Scheduler, CpuId) {
        let mut sched = Scheduler::new(Box::new(PerformanceMode), Duration::from_millis(100));
        let pkg = sched.add_package();
        let core = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let cpu = sched.add_cpu(core);
        (sched, cpu)
    }

    #[test]
    fn enqueue_then_tick_dispatches_the_thread() {
        let (mut sched, cpu) = single_core_scheduler();
        let thread = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        sched.on_thread_enqueue(thread, Instant::ZERO).unwrap();
        let chosen = sched.on_tick(cpu, None, Instant::from_micros(1)).unwrap();
        assert_eq!(chosen, ChosenThread::Found(thread));
        assert_eq!(sched.thread(thread).unwrap().state, ThreadState::Running);
    }

    #[test]
    fn empty_cpu_dispatches_idle() {
        let (mut sched, cpu) = single_core_scheduler();
        let chosen = sched.on_tick(cpu, None, Instant::ZERO).unwrap();
        assert_eq!(chosen, ChosenThread::Idle);
    }

    #[test]
    fn priority_change_updates_weight_and_rt_classification() {
        let (mut sched, _cpu) = single_core_scheduler();
        let thread = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        sched.set_thread_priority(thread, crate::config::priority::RT_BAND).unwrap();
        assert!(sched.thread(thread).unwrap().is_real_time());
    }

    #[test]
    fn exhausted_team_quota_is_honored_by_a_full_tick() {
        let (mut sched, cpu) = single_core_scheduler();
        let team = sched.spawn_team(10);
        let a = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, Some(team));
        sched.on_thread_enqueue(a, Instant::ZERO).unwrap();
        sched.on_tick(cpu, None, Instant::from_micros(1)).unwrap();
        sched.percpu(cpu).set_active_team(Some(team));

        if let Some(t) = sched.teams.get_mut(team.index() as u32) {
            t.quota_exhausted = true;
        }

        let b = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        sched.on_thread_enqueue(b, Instant::from_micros(2)).unwrap();

        let chosen = sched.on_tick(cpu, Some(a), Instant::from_micros(3)).unwrap();
        assert_eq!(chosen, ChosenThread::Found(b), "quota-exhausted team must fall through to another team's thread");
    }

    #[test]
    fn disabling_the_only_cpu_on_a_core_marks_it_defunct() {
        let (mut sched, cpu) = single_core_scheduler();
        sched.set_cpu_enabled(cpu, false);
        let core = sched.percpu(cpu).core;
        assert!(sched.topology.core(core).unwrap().defunct);
    }

    #[test]
    fn irq_routing_picks_the_least_loaded_enabled_cpu() {
        let mut sched = Scheduler::new(Box::new(PerformanceMode), Duration::from_millis(100));
        let pkg = sched.add_package();
        let core = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let cpu0 = sched.add_cpu(core);
        let cpu1 = sched.add_cpu(core);
        sched.percpu(cpu0).set_instantaneous_load(900);
        sched.percpu(cpu1).set_instantaneous_load(50);
        let chosen = sched.select_target_cpu_for_irq(core, IrqId(1), 10, 1000, |_| None);
        assert_eq!(chosen, Some(cpu1));
    }

    #[test]
    fn on_tick_never_requeues_the_idle_thread() {
        let (mut sched, cpu) = single_core_scheduler();
        let idle = sched.percpu(cpu).idle_thread;
        let chosen = sched.on_tick(cpu, Some(idle), Instant::from_micros(1)).unwrap();
        assert_eq!(chosen, ChosenThread::Idle);
        assert!(!sched.percpu(cpu).run_queue.lock().contains(idle));
    }

    #[test]
    fn needed_load_transfers_between_cores_on_migration() {
        let mut sched = Scheduler::new(Box::new(PerformanceMode), Duration::from_millis(100));
        let pkg = sched.add_package();
        let core_a = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let core_b = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let cpu_a = sched.add_cpu(core_a);
        let cpu_b = sched.add_cpu(core_b);

        let thread = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        if let Some(t) = sched.threads.get_mut(thread.index() as u32) {
            t.needed_load = 400;
            t.cpu_mask = CpuMask::single(cpu_a);
        }
        sched.on_thread_enqueue(thread, Instant::ZERO).unwrap();
        assert_eq!(sched.thread(thread).unwrap().home_core, Some(core_a));
        assert_eq!(sched.topology.core(core_a).unwrap().needed_load, 400);
        assert_eq!(sched.topology.core(core_b).unwrap().needed_load, 0);

        sched.percpu(cpu_a).run_queue.lock().remove(thread).unwrap();
        if let Some(t) = sched.threads.get_mut(thread.index() as u32) {
            t.enqueued = false;
            t.cpu_mask = CpuMask::single(cpu_b);
        }
        sched.on_thread_enqueue(thread, Instant::from_micros(1)).unwrap();

        assert_eq!(sched.thread(thread).unwrap().home_core, Some(core_b));
        assert_eq!(sched.topology.core(core_a).unwrap().needed_load, 0);
        assert_eq!(sched.topology.core(core_b).unwrap().needed_load, 400);
    }

    #[test]
    fn periodic_balance_moves_a_thread_off_a_high_loaded_core() {
        let mut sched = Scheduler::new(Box::new(PerformanceMode), Duration::from_millis(100));
        let pkg = sched.add_package();
        let core_a = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let core_b = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let cpu_a = sched.add_cpu(core_a);
        let cpu_b = sched.add_cpu(core_b);

        sched.topology.core_mut(core_a).unwrap().load = crate::config::HIGH_LOAD_THRESHOLD + 10;
        sched.loads.set_load(core_a, None, crate::config::HIGH_LOAD_THRESHOLD + 10);
        sched.topology.core_mut(core_b).unwrap().load = 0;
        sched.loads.set_load(core_b, None, 0);

        let thread = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        if let Some(t) = sched.threads.get_mut(thread.index() as u32) {
            t.lag = crate::config::MIN_LAG_TO_STEAL + 1;
        }
        sched.percpu(cpu_a).run_queue.lock().add(thread, Instant::from_micros(100)).unwrap();

        let migrated = sched.periodic_balance(cpu_b, Instant::from_millis(11));
        assert!(migrated);
        assert!(sched.percpu(cpu_b).run_queue.lock().contains(thread));
        assert!(!sched.percpu(cpu_a).run_queue.lock().contains(thread));
        assert_eq!(sched.thread(thread).unwrap().home_core, Some(core_b));
    }

    #[test]
    fn try_steal_only_triggers_when_local_queue_is_empty() {
        let mut sched = Scheduler::new(Box::new(PerformanceMode), Duration::from_millis(100));
        let pkg = sched.add_package();
        let core_a = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let core_b = sched.add_core(pkg, CoreType::Uniform, crate::config::NOMINAL_CAPACITY, 0);
        let cpu_a = sched.add_cpu(core_a);
        let cpu_b = sched.add_cpu(core_b);

        let busy = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        sched.percpu(cpu_b).run_queue.lock().add(busy, Instant::from_micros(5)).unwrap();

        let victim = sched.spawn_thread(crate::config::priority::LOWEST_ACTIVE, 0, None);
        if let Some(t) = sched.threads.get_mut(victim.index() as u32) {
            t.lag = crate::config::MIN_LAG_TO_STEAL + 1;
        }
        sched.percpu(cpu_a).run_queue.lock().add(victim, Instant::from_micros(10)).unwrap();

        assert!(!sched.try_steal(cpu_b, Instant::from_millis(1)), "a non-empty local queue must not steal");
        assert!(sched.percpu(cpu_a).run_queue.lock().contains(victim));

        sched.percpu(cpu_b).run_queue.lock().remove(busy).unwrap();
        assert!(sched.try_steal(cpu_b, Instant::from_millis(1)));
        assert!(sched.percpu(cpu_b).run_queue.lock().contains(victim));
    }
}
