//! Scheduler statistics (ambient stack addition, §SPEC_FULL.md §2).
//!
//! Grounded on the teacher's `SchedulerStats`/`PerCpuSchedData`
//! counters (`scheduler/types.rs`, `scheduler/percpu.rs`). Not a named
//! `spec.md` component, but required to make the testable properties
//! in spec §8 (migration count bound in S3, migration cooldown in
//! property 8) observable without reaching into private fields.

use core::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters for one CPU. All fields saturate rather than
/// wrap on overflow in spirit (u64 is large enough that wraparound is
/// not a practical concern over a kernel's uptime).
#[derive(Default)]
pub struct CpuStats {
    pub context_switches: AtomicU64,
    pub voluntary_switches: AtomicU64,
    pub preemptions: AtomicU64,
    pub migrations_out: AtomicU64,
    pub migrations_in: AtomicU64,
    pub steal_successes: AtomicU64,
    pub steal_failures: AtomicU64,
    pub idle_ns: AtomicU64,
}

impl CpuStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_context_switch(&self, voluntary: bool) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
        if voluntary {
            self.voluntary_switches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_out(&self) {
        self.migrations_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_migration_in(&self) {
        self.migrations_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steal_outcome(&self, success: bool) {
        if success {
            self.steal_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.steal_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> CpuStatsSnapshot {
        CpuStatsSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            voluntary_switches: self.voluntary_switches.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            migrations_out: self.migrations_out.load(Ordering::Relaxed),
            migrations_in: self.migrations_in.load(Ordering::Relaxed),
            steal_successes: self.steal_successes.load(Ordering::Relaxed),
            steal_failures: self.steal_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`CpuStats`], cheap to hand to a debug
/// dumper or a test assertion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuStatsSnapshot {
    pub context_switches: u64,
    pub voluntary_switches: u64,
    pub preemptions: u64,
    pub migrations_out: u64,
    pub migrations_in: u64,
    pub steal_successes: u64,
    pub steal_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_switch_counts_split_voluntary_and_total() {
        let stats = CpuStats::new();
        stats.record_context_switch(true);
        stats.record_context_switch(false);
        let snap = stats.snapshot();
        assert_eq!(snap.context_switches, 2);
        assert_eq!(snap.voluntary_switches, 1);
    }

    #[test]
    fn migration_counters_track_direction() {
        let stats = CpuStats::new();
        stats.record_migration_out();
        stats.record_migration_out();
        stats.record_migration_in();
        let snap = stats.snapshot();
        assert_eq!(snap.migrations_out, 2);
        assert_eq!(snap.migrations_in, 1);
    }

    #[test]
    fn steal_outcomes_are_tallied_separately() {
        let stats = CpuStats::new();
        stats.record_steal_outcome(true);
        stats.record_steal_outcome(false);
        stats.record_steal_outcome(false);
        let snap = stats.snapshot();
        assert_eq!(snap.steal_successes, 1);
        assert_eq!(snap.steal_failures, 2);
    }
}
