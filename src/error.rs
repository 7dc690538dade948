//! Error kinds for the scheduling core (spec §7).
//!
//! The core has no recoverable *external* failures. `ContractViolation`
//! is a programming bug (out-of-order locks, double-enqueue, removing a
//! thread that isn't queued) and is always fatal; everything else is
//! either informational (`AffinityInfeasible`) or locally recovered
//! (`PoolExhausted`, `TransientRaceLoss`).

use core::fmt;

/// Result alias used throughout the crate.
pub type SchedResult<T> = Result<T, SchedError>;

/// The four error kinds the core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No enabled CPU matches a thread's affinity mask. Never a crash:
    /// the thread keeps its prior placement or pins to the last
    /// compatible CPU.
    AffinityInfeasible,
    /// An internal fixed-size pool (e.g. the steal-candidate buffer)
    /// was exhausted. The caller should degrade gracefully (e.g. steal
    /// fewer candidates) and log a warning.
    PoolExhausted,
    /// An assertion failure: out-of-order lock acquisition, double
    /// enqueue, removing a thread not present in any queue, and
    /// similar. Fatal in every build.
    ContractViolation(&'static str),
    /// A benign race loss, e.g. a steal candidate vanished between
    /// peek and remove. The caller retries the next candidate up to a
    /// bounded limit, then falls back to idle.
    TransientRaceLoss,
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AffinityInfeasible => write!(f, "no enabled CPU matches affinity mask"),
            SchedError::PoolExhausted => write!(f, "internal pool exhausted"),
            SchedError::ContractViolation(reason) => {
                write!(f, "scheduler contract violation: {reason}")
            }
            SchedError::TransientRaceLoss => write!(f, "transient race loss"),
        }
    }
}

/// Raise a [`SchedError::ContractViolation`] and panic immediately.
///
/// Contract violations are never caught (§4.11, §7): this is not
/// cfg-gated to debug builds, release builds abort too.
#[macro_export]
macro_rules! contract_violation {
    ($reason:expr) => {{
        log::error!("contract violation: {}", $reason);
        panic!("scheduler contract violation: {}", $reason);
    }};
}
