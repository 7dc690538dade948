//! Debug dump surface (SPEC_FULL.md §2; spec §6 mentions a
//! "console-command registration API for the dumpers" as a
//! collaborator).
//!
//! The console-command dispatcher itself is out of scope (spec §1);
//! this module only produces the human-readable reports such a
//! console would print, through [`DebugSink`] so an embedder can wire
//! them into whatever command registry it has.

use alloc::format;
use alloc::string::String;

use crate::arena::{CoreId, CpuId, TeamId};
use crate::percpu::PerCpuRecord;
use crate::team::TeamRecord;

/// A sink an embedder implements to receive dump output (e.g. write
/// to the serial console or a ring buffer).
pub trait DebugSink {
    fn write_line(&mut self, line: &str);
}

/// A [`DebugSink`] that just accumulates lines into a `String`, handy
/// for tests and for callers that want the whole report at once.
#[derive(Default)]
pub struct StringSink {
    pub buffer: String,
}

impl DebugSink for StringSink {
    fn write_line(&mut self, line: &str) {
        self.buffer.push_str(line);
        self.buffer.push('\n');
    }
}

/// Dumps one CPU's run queue depth, load, and balancing cooldown
/// state.
pub fn dump_cpu(cpu: CpuId, percpu: &PerCpuRecord, sink: &mut dyn DebugSink) {
    sink.write_line(&format!("cpu {}: core={}", cpu.index(), percpu.core.index()));
    sink.write_line(&format!(
        "  queue_depth={} instant_load={} long_window_load={}",
        percpu.task_count(),
        percpu.instantaneous_load(),
        percpu.long_window_load()
    ));
    sink.write_line(&format!("  active_team={:?}", percpu.active_team().map(|t| t.index())));
}

/// Dumps a core's ready threads in ascending `virtual_deadline` order.
pub fn dump_run_queue(core: CoreId, percpu: &PerCpuRecord, sink: &mut dyn DebugSink) {
    sink.write_line(&format!("run queue for core {}:", core.index()));
    let queue = percpu.run_queue.lock();
    let mut entries: alloc::vec::Vec<_> = queue.iter().collect();
    entries.sort_by_key(|(_, deadline)| *deadline);
    for (thread, deadline) in entries {
        sink.write_line(&format!("  thread={} vdeadline={}", thread.index(), deadline.as_micros()));
    }
}

/// Dumps a team's quota accounting.
pub fn dump_team(team_id: TeamId, team: &TeamRecord, sink: &mut dyn DebugSink) {
    sink.write_line(&format!(
        "team {}: quota={}% usage={}us allowance={}us exhausted={} team_vruntime={}",
        team_id.index(),
        team.cpu_quota_percent,
        team.quota_period_usage.as_micros(),
        team.current_quota_allowance.as_micros(),
        team.quota_exhausted,
        team.team_virtual_runtime
    ));
}
