//! # sched-core
//!
//! The core of a two-tier EEVDF-based CPU scheduler for SMP hardware,
//! extracted as a standalone engine consumed by an embedding kernel
//! through the collaborator traits in [`collab`].
//!
//! ## Scope
//!
//! This crate owns the per-CPU EEVDF run queue and dispatch decision,
//! the per-thread EEVDF parameter machine, the per-team quota layer
//! that gates it, CPU/core/package topology and load bookkeeping,
//! SMT-aware logical-CPU selection, heterogeneous (big.LITTLE) core
//! placement, the periodic load balancer and opportunistic work
//! stealing, the I/O-bound slice heuristic, and the IRQ target-CPU
//! selector.
//!
//! Trap/context-switch code, per-arch timers, the VM system, device
//! drivers, syscall plumbing, and the debug console command dispatcher
//! are not implemented here; they are consumed only through the narrow
//! interfaces in [`collab`].
//!
//! ## Lock ordering
//!
//! Locks must be acquired in the following order; acquiring them out
//! of order is a contract violation and a potential deadlock.
//!
//! ```text
//! Lock Hierarchy (acquire in this order, never reverse):
//!
//! Level 1 (outermost):
//!   - Per-thread scheduler lock (on the thread record)
//!
//! Level 2:
//!   - Per-CPU run-queue spinlock
//!
//! Level 3:
//!   - Per-core CPU-heap spinlock
//!
//! Level 4:
//!   - Per-shard core-load-heap rw-spinlock
//!
//! Level 5:
//!   - Per-package core-list rw-spinlock
//!
//! Level 6:
//!   - Global idle-package rw-spinlock
//!
//! Level 7 (innermost):
//!   - IRQ-task affinity map spinlock
//! ```
//!
//! Levels 2-7 are acquired with interrupts disabled and must never be
//! held across a voluntary suspension. The per-thread lock may be held
//! across short computations but never across an out-of-order
//! acquire/release of levels 2-7.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(not(test))]
extern crate alloc;
#[cfg(test)]
extern crate std as alloc;

pub mod arena;
pub mod balance;
pub mod collab;
pub mod config;
pub mod cpu_mask;
pub mod debug;
pub mod dispatch;
pub mod eevdf;
pub mod error;
pub mod irq;
pub mod load;
pub mod percpu;
pub mod placement;
pub mod runqueue;
pub mod scheduler;
pub mod stats;
pub mod team;
pub mod thread;
pub mod time;
pub mod topology;

pub use error::{SchedError, SchedResult};
pub use scheduler::Scheduler;
