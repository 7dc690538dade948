//! Periodic load balancer and opportunistic work stealing (spec §4.7).
//!
//! Grounded on `Daemoniorum-LLC-nyx-os`'s `sched/mod.rs::{load_balance,
//! try_steal_work, periodic_load_balance}`, which uses `split_at_mut`
//! to get simultaneous mutable access to two per-CPU slots in one
//! `Vec` without double-borrowing; the same trick is used here by the
//! caller (`scheduler.rs`) when it has both CPUs' `PerCpuRecord`s in
//! one arena. This module only decides *which* migrations/steals are
//! allowed; the caller performs the actual queue moves since it alone
//! holds both run-queue locks in the correct order.

use crate::arena::ThreadId;
use crate::config::{MAX_STEAL_CANDIDATES_TO_CHECK, MIGRATION_COOLDOWN, MIN_LAG_TO_STEAL};
use crate::cpu_mask::CpuMask;
use crate::time::Instant;

/// Facts about a candidate thread, supplied by the caller so this
/// module never needs to borrow the thread arena directly.
#[derive(Debug, Clone, Copy)]
pub struct MigrationCandidate {
    pub thread: ThreadId,
    pub affinity: CpuMask,
    pub last_migration_time: Instant,
    pub lag: i64,
    pub is_real_time_pinned_to_source: bool,
}

/// Whether `candidate` may be moved to `destination_cpu` right now
/// (spec §4.7, periodic balancer bullet list and property 8).
pub fn may_migrate(candidate: &MigrationCandidate, destination_cpu: crate::arena::CpuId, now: Instant) -> bool {
    if candidate.is_real_time_pinned_to_source {
        return false;
    }
    if !candidate.affinity.is_set(destination_cpu) {
        return false;
    }
    if now.saturating_since(candidate.last_migration_time) < MIGRATION_COOLDOWN {
        return false;
    }
    candidate.lag > MIN_LAG_TO_STEAL
}

/// Picks the first migratable candidate from `candidates`, in the
/// order given (callers pass them in run-queue / deadline order).
pub fn select_migration_candidate(
    candidates: impl IntoIterator<Item = MigrationCandidate>,
    destination_cpu: crate::arena::CpuId,
    now: Instant,
) -> Option<ThreadId> {
    candidates
        .into_iter()
        .find(|c| may_migrate(c, destination_cpu, now))
        .map(|c| c.thread)
}

/// Work-stealing victim/backoff cooldown state, tracked per-CPU
/// (mirrors fields on `PerCpuRecord`; kept here as a pure helper so
/// the cooldown arithmetic is independently testable).
pub fn can_steal_from_victim(last_time_task_stolen_from: Instant, now: Instant, victim_cooldown: crate::time::Duration) -> bool {
    now.saturating_since(last_time_task_stolen_from) >= victim_cooldown
}

/// Scans up to [`MAX_STEAL_CANDIDATES_TO_CHECK`] tail candidates of a
/// victim's run queue (already extracted by the caller in the order
/// the spec calls "tail candidates", i.e. furthest from the queue's
/// min-deadline head) and returns the first stealable one.
pub fn find_steal_candidate(
    tail_candidates: &[MigrationCandidate],
    thief_cpu: crate::arena::CpuId,
    now: Instant,
) -> Option<ThreadId> {
    tail_candidates
        .iter()
        .take(MAX_STEAL_CANDIDATES_TO_CHECK)
        .find(|c| may_migrate(c, thief_cpu, now))
        .map(|c| c.thread)
}
