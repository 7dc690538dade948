//! Per-CPU run queue: an intrusive, indexed binary min-heap keyed by
//! `virtual_deadline` (spec §4.1).
//!
//! An auxiliary `thread -> heap index` map gives O(log N) `remove`
//! and `update` in addition to `pop_min`/`peek_min`; this is the
//! structural generalization the spec asks for over the teacher's
//! fixed-array insertion-sorted queue in `scheduler/percpu.rs`, which
//! only supports small `PERCPU_RQ_SIZE` arrays at O(N) per mutation.
//! Ties in `virtual_deadline` are broken by thread identity (`ThreadId`
//! ordering) to keep iteration order deterministic.

use hashbrown::HashMap;

use crate::arena::ThreadId;
use crate::error::SchedError;
use crate::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    thread: ThreadId,
    deadline: Instant,
}

impl Entry {
    /// Orders by `(deadline, thread)`: lower deadline first, ties
    /// broken by thread identity.
    fn less_than(&self, other: &Entry) -> bool {
        (self.deadline, self.thread) < (other.deadline, other.thread)
    }
}

/// Indexed binary min-heap of ready threads for one CPU.
#[derive(Debug, Default)]
pub struct RunQueue {
    heap: alloc::vec::Vec<Entry>,
    index: HashMap<ThreadId, usize>,
}

impl RunQueue {
    pub fn new() -> Self {
        RunQueue { heap: alloc::vec::Vec::new(), index: HashMap::new() }
    }

    pub fn count(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn contains(&self, thread: ThreadId) -> bool {
        self.index.contains_key(&thread)
    }

    /// Insert a thread. Contract violation if already enqueued
    /// (spec §8 property 2, "at-most-once enqueue").
    pub fn add(&mut self, thread: ThreadId, deadline: Instant) -> Result<(), SchedError> {
        if self.index.contains_key(&thread) {
            return Err(SchedError::ContractViolation("enqueue of an already-enqueued thread"));
        }
        let idx = self.heap.len();
        self.heap.push(Entry { thread, deadline });
        self.index.insert(thread, idx);
        self.sift_up(idx);
        Ok(())
    }

    /// Remove a thread by identity. Contract violation if absent.
    pub fn remove(&mut self, thread: ThreadId) -> Result<Instant, SchedError> {
        let idx = self
            .index
            .remove(&thread)
            .ok_or(SchedError::ContractViolation("remove of a thread not present in this queue"))?;
        let deadline = self.heap[idx].deadline;
        let last = self.heap.len() - 1;
        if idx != last {
            self.heap.swap(idx, last);
            self.index.insert(self.heap[idx].thread, idx);
        }
        self.heap.pop();
        if idx < self.heap.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }
        Ok(deadline)
    }

    /// Re-key a thread whose `virtual_deadline` changed.
    pub fn update(&mut self, thread: ThreadId, new_deadline: Instant) -> Result<(), SchedError> {
        let idx = *self
            .index
            .get(&thread)
            .ok_or(SchedError::ContractViolation("update of a thread not present in this queue"))?;
        self.heap[idx].deadline = new_deadline;
        self.sift_down(idx);
        self.sift_up(idx);
        Ok(())
    }

    pub fn peek_min(&self) -> Option<(ThreadId, Instant)> {
        self.heap.first().map(|e| (e.thread, e.deadline))
    }

    pub fn pop_min(&mut self) -> Option<(ThreadId, Instant)> {
        let top = *self.heap.first()?;
        self.remove(top.thread).ok();
        Some((top.thread, top.deadline))
    }

    /// Pop up to `k` smallest-deadline threads, for balancing.
    pub fn pop_multiple(&mut self, k: usize) -> alloc::vec::Vec<(ThreadId, Instant)> {
        let mut out = alloc::vec::Vec::with_capacity(k.min(self.heap.len()));
        for _ in 0..k {
            match self.pop_min() {
                Some(item) => out.push(item),
                None => break,
            }
        }
        out
    }

    /// Insert a batch, for balancing. Stops at the first contract
    /// violation (duplicate) and returns it.
    pub fn add_batch(&mut self, items: impl IntoIterator<Item = (ThreadId, Instant)>) -> Result<(), SchedError> {
        for (thread, deadline) in items {
            self.add(thread, deadline)?;
        }
        Ok(())
    }

    pub fn deadline_of(&self, thread: ThreadId) -> Option<Instant> {
        self.index.get(&thread).map(|&idx| self.heap[idx].deadline)
    }

    /// Iterate threads in arbitrary (heap-array) order. Used by
    /// dispatch scans, which need deadline order and must use
    /// `peek_min`/`pop_min` in sequence instead.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, Instant)> + '_ {
        self.heap.iter().map(|e| (e.thread, e.deadline))
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.heap[idx].less_than(&self.heap[parent]) {
                self.heap.swap(idx, parent);
                self.index.insert(self.heap[idx].thread, idx);
                self.index.insert(self.heap[parent].thread, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.heap[left].less_than(&self.heap[smallest]) {
                smallest = left;
            }
            if right < len && self.heap[right].less_than(&self.heap[smallest]) {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.heap.swap(idx, smallest);
            self.index.insert(self.heap[idx].thread, idx);
            self.index.insert(self.heap[smallest].thread, smallest);
            idx = smallest;
        }
    }

    /// Ordering invariant check (spec §8 property 1, used by tests):
    /// every non-root index's key is not less than its parent's.
    #[cfg(test)]
    fn heap_invariant_holds(&self) -> bool {
        for i in 1..self.heap.len() {
            let parent = (i - 1) / 2;
            if self.heap[i].less_than(&self.heap[parent]) {
                return false;
            }
        }
        true
    }
}
