//! Per-team quota record and the quota layer (spec §3.2, §4.4).
//!
//! A team groups threads under a shared CPU-quota policy. The
//! dispatcher (`dispatch.rs`) only reads `quota_exhausted`; everything
//! that updates it lives here, driven by the embedder's quota-period
//! boundary callback and by per-slice accounting.

use crate::config::BASE_WEIGHT;
use crate::time::Duration;

/// Per-team scheduling state.
#[derive(Debug, Clone)]
pub struct TeamRecord {
    pub cpu_quota_percent: u32,
    pub quota_period_usage: Duration,
    pub current_quota_allowance: Duration,
    pub quota_exhausted: bool,
    pub team_virtual_runtime: u64,
}

impl TeamRecord {
    /// `cpu_quota_percent == 0` means unlimited.
    pub fn new(cpu_quota_percent: u32) -> Self {
        TeamRecord {
            cpu_quota_percent,
            quota_period_usage: Duration::ZERO,
            current_quota_allowance: Duration::ZERO,
            quota_exhausted: false,
            team_virtual_runtime: 0,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.cpu_quota_percent == 0
    }

    /// Quota-period boundary callback (§4.4): resets usage, clears the
    /// exhausted flag, and recomputes the allowance for the new
    /// period.
    pub fn start_new_period(&mut self, quota_period: Duration) {
        self.quota_period_usage = Duration::ZERO;
        self.quota_exhausted = false;
        if self.is_unlimited() {
            self.current_quota_allowance = Duration::ZERO;
        } else {
            self.current_quota_allowance =
                Duration::from_micros(quota_period.as_micros() * self.cpu_quota_percent as u64 / 100);
        }
    }

    /// Account a completed slice's active time against the team's
    /// quota and advance its virtual runtime (§4.4).
    pub fn account_active_time(&mut self, active_time: Duration) {
        if self.is_unlimited() {
            return;
        }
        self.quota_period_usage = self.quota_period_usage.saturating_add(active_time);
        if self.quota_period_usage >= self.current_quota_allowance {
            self.quota_exhausted = true;
        }
        let delta = active_time.as_micros() as u64 * BASE_WEIGHT as u64 / self.cpu_quota_percent as u64;
        self.team_virtual_runtime = self.team_virtual_runtime.saturating_add(delta);
    }

    /// Invariant check (spec §3.2): `quota_exhausted <=>
    /// (allowance > 0 && usage >= allowance)`.
    pub fn invariant_holds(&self) -> bool {
        if self.is_unlimited() {
            return !self.quota_exhausted;
        }
        self.quota_exhausted == (self.current_quota_allowance > Duration::ZERO && self.quota_period_usage >= self.current_quota_allowance)
    }
}
