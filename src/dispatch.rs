//! The dispatch engine: `choose_next_thread` (spec §4.2).
//!
//! Runs with the per-CPU run-queue lock held and interrupts disabled.
//! Scans the queue once, in `virtual_deadline` order, holding
//! non-matching candidates in memory; phases A-C are then evaluated
//! against that single ordered snapshot instead of re-scanning the
//! live heap per phase, which keeps total scanned work bounded by the
//! queue size exactly once rather than up to three times.

use alloc::vec::Vec;

use crate::arena::{TeamId, ThreadId};
use crate::runqueue::RunQueue;
use crate::time::Instant;

/// Read-only facts about a queued thread the dispatcher needs, without
/// borrowing the thread arena directly (that arena lives in
/// `scheduler.rs`, alongside the per-thread lock from the lock
/// hierarchy in `lib.rs`).
#[derive(Debug, Clone, Copy)]
pub struct ThreadDispatchInfo {
    pub team: Option<TeamId>,
    pub is_real_time: bool,
    pub eligible_time: Instant,
}

/// Outcome of a dispatch decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChosenThread {
    Found(ThreadId),
    /// No candidate thread was eligible; run the CPU's idle thread.
    Idle,
}

/// `choose_next_thread` (spec §4.2, phases A-D). `old_thread_ready`
/// re-insertion (step 1, the possible requeue of the previously
/// running thread) is the caller's responsibility before invoking
/// this, since it requires the EEVDF parameter machine, not just
/// queue mechanics.
pub fn choose_next_thread(
    queue: &mut RunQueue,
    active_team: Option<TeamId>,
    team_quota_exhausted: impl Fn(TeamId) -> bool,
    info_of: impl Fn(ThreadId) -> ThreadDispatchInfo,
    now: Instant,
) -> ChosenThread {
    let queue_len = queue.count();
    let mut held: Vec<(ThreadId, Instant, ThreadDispatchInfo)> = Vec::with_capacity(queue_len);

    while let Some((thread, deadline)) = queue.pop_min() {
        let info = info_of(thread);
        held.push((thread, deadline, info));
    }
    debug_assert!(held.len() == queue_len);

    let eligible = |info: &ThreadDispatchInfo| now >= info.eligible_time;

    // Phase A: active-team real-time bypass.
    let phase_a = active_team.and_then(|team| {
        held.iter()
            .position(|(_, _, info)| info.team == Some(team) && info.is_real_time && eligible(info))
    });

    // Phase B: active-team in-quota.
    let phase_b = phase_a.or_else(|| {
        let team = active_team?;
        if team_quota_exhausted(team) {
            return None;
        }
        held.iter().position(|(_, _, info)| info.team == Some(team) && eligible(info))
    });

    // Phase C: any eligible thread of any team.
    let chosen_index = phase_b.or_else(|| held.iter().position(|(_, _, info)| eligible(info)));

    let result = match chosen_index {
        Some(idx) => ChosenThread::Found(held[idx].0),
        None => ChosenThread::Idle,
    };

    for (i, (thread, deadline, _)) in held.into_iter().enumerate() {
        if Some(i) == chosen_index {
            continue;
        }
        queue.add(thread, deadline).expect("re-insert of a just-popped thread cannot collide");
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(team: Option<TeamId>, rt: bool, eligible_at: u64) -> ThreadDispatchInfo {
        ThreadDispatchInfo { team, is_real_time: rt, eligible_time: Instant::from_micros(eligible_at) }
    }

    #[test]
    fn empty_queue_dispatches_idle() {
        let mut q = RunQueue::new();
        let result = choose_next_thread(&mut q, None, |_| false, |_| info(None, false, 0), Instant::ZERO);
        assert_eq!(result, ChosenThread::Idle);
    }

    #[test]
    fn phase_a_rt_bypass_wins_over_earlier_deadline_non_rt() {
        let mut q = RunQueue::new();
        let team = TeamId::new(1);
        let rt_thread = ThreadId::new(1);
        let normal_thread = ThreadId::new(2);
        q.add(normal_thread, Instant::from_micros(10)).unwrap();
        q.add(rt_thread, Instant::from_micros(50)).unwrap();

        let infos = move |tid: ThreadId| {
            if tid == rt_thread {
                info(Some(team), true, 0)
            } else {
                info(Some(team), false, 0)
            }
        };
        let result = choose_next_thread(&mut q, Some(team), |_| false, infos, Instant::from_micros(100));
        assert_eq!(result, ChosenThread::Found(rt_thread));
        assert_eq!(q.count(), 1);
        assert!(q.contains(normal_thread));
    }

    #[test]
    fn quota_exhausted_team_falls_through_to_general_eligible() {
        let mut q = RunQueue::new();
        let exhausted_team = TeamId::new(1);
        let other_team = TeamId::new(2);
        let a = ThreadId::new(1);
        let b = ThreadId::new(2);
        q.add(a, Instant::from_micros(10)).unwrap();
        q.add(b, Instant::from_micros(20)).unwrap();

        let infos = move |tid: ThreadId| {
            if tid == a {
                info(Some(exhausted_team), false, 0)
            } else {
                info(Some(other_team), false, 0)
            }
        };
        let result = choose_next_thread(&mut q, Some(exhausted_team), |t| t == exhausted_team, infos, Instant::from_micros(100));
        assert_eq!(result, ChosenThread::Found(a), "phase C still picks the earliest eligible deadline of any team");
    }

    #[test]
    fn ineligible_threads_are_reinserted_and_idle_is_chosen() {
        let mut q = RunQueue::new();
        let t = ThreadId::new(1);
        q.add(t, Instant::from_micros(10)).unwrap();
        let result = choose_next_thread(&mut q, None, |_| false, |_| info(None, false, 1_000), Instant::from_micros(0));
        assert_eq!(result, ChosenThread::Idle);
        assert_eq!(q.count(), 1);
        assert!(q.contains(t));
    }

    #[test]
    fn no_active_team_still_finds_general_eligible_thread() {
        let mut q = RunQueue::new();
        let t = ThreadId::new(1);
        q.add(t, Instant::from_micros(5)).unwrap();
        let result = choose_next_thread(&mut q, None, |_| false, |_| info(Some(TeamId::new(9)), false, 0), Instant::from_micros(5));
        assert_eq!(result, ChosenThread::Found(t));
    }
}
