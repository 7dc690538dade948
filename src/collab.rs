//! External collaborator interfaces (spec §6).
//!
//! Everything the core consumes from the rest of a kernel — timers,
//! per-CPU context, IPI, IRQ assignment, the team object, and the
//! debug console — is expressed as a narrow trait here. None of these
//! are implemented in this crate; an embedding kernel supplies them.

use crate::arena::{CoreId, CpuId, PackageId, TeamId, ThreadId};
use crate::irq::IrqId;
use crate::time::{Duration, Instant};

/// A one-shot, per-CPU relative timer (quantum timer, balancer tick).
pub trait TimerService {
    /// Arms a one-shot timer on `cpu` firing after `duration`. The
    /// handler never does scheduling work itself (spec §5): it only
    /// marks `invoke_scheduler`/`preempted` for the next dispatch.
    fn arm_one_shot(&self, cpu: CpuId, duration: Duration);
    /// Cancels any pending one-shot timer on `cpu` (voluntary sleep,
    /// context switch, CPU disable).
    fn cancel(&self, cpu: CpuId);
}

/// Per-CPU context the core needs but does not own.
pub trait PerCpuContext {
    /// The CPU this call is executing on.
    fn this_cpu(&self) -> CpuId;
    /// The thread currently running on `cpu`, if any.
    fn running_thread(&self, cpu: CpuId) -> Option<ThreadId>;
    /// Wall-clock time `cpu` has spent running non-idle threads since
    /// some collaborator-defined epoch.
    fn active_time(&self, cpu: CpuId) -> Duration;
    /// Wall-clock time `cpu` has spent servicing interrupts.
    fn interrupt_time(&self, cpu: CpuId) -> Duration;
    /// `(core, package)` this logical CPU belongs to.
    fn topology_ids(&self, cpu: CpuId) -> (CoreId, PackageId);
}

/// Inter-processor interrupt sender.
pub trait IpiSender {
    /// Requests `cpu` invoke its dispatch loop at the next
    /// opportunity (spec §5: "happens-before that CPU's next
    /// dispatch").
    fn send_reschedule(&self, cpu: CpuId);
}

/// IRQ assignment and performance-level hooks (spec §6).
pub trait IrqAssignmentHook {
    fn assign_io_interrupt_to_cpu(&self, irq: IrqId, cpu: CpuId);
    /// `scale` is a `[0, 1024]`-normalized performance level, same
    /// scale as `performance_capacity`.
    fn set_cpu_performance_level(&self, cpu: CpuId, scale: u32);
}

/// The team object and its quota-period boundary callback (spec §4.4,
/// §6). The scheduler core constrains only what the dispatcher does
/// with `quota_exhausted`/`current_active_team`; picking which team is
/// active on a CPU and when a quota period closes is this
/// collaborator's job.
pub trait TeamProvider {
    fn team_of(&self, thread: ThreadId) -> Option<TeamId>;
    /// Called by the embedder when a team's quota period closes; the
    /// core does not drive this itself.
    fn on_quota_period_boundary(&self, team: TeamId, now: Instant);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use spin::Mutex;

    struct RecordingIpi {
        sent: Mutex<Vec<CpuId>>,
    }

    impl IpiSender for RecordingIpi {
        fn send_reschedule(&self, cpu: CpuId) {
            self.sent.lock().push(cpu);
        }
    }

    #[test]
    fn ipi_sender_trait_object_is_usable() {
        let ipi = RecordingIpi { sent: Mutex::new(Vec::new()) };
        let dyn_ipi: &dyn IpiSender = &ipi;
        dyn_ipi.send_reschedule(CpuId::new(3));
        assert_eq!(*ipi.sent.lock(), alloc::vec![CpuId::new(3)]);
    }
}
