//! CPU / core / package topology model (spec §2.1, §3.3-§3.6).
//!
//! Enumerates logical CPUs, the physical cores they belong to (SMT
//! siblings share a core), and the packages cores belong to, plus the
//! per-core performance capacity and energy-efficiency descriptors
//! used by placement and the IRQ router. Authoritative values for
//! `performance_capacity`/`energy_efficiency` are platform-specific
//! and populated by the embedder during enumeration (spec §9, open
//! question); this module only stores and exposes them.

use alloc::vec::Vec;

use crate::arena::{Arena, CoreId, CpuId, PackageId};
use crate::config::NOMINAL_CAPACITY;
use crate::cpu_mask::CpuMask;

/// Heterogeneous core classification (big.LITTLE).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreType {
    Big,
    Little,
    Uniform,
    Unknown,
}

impl Default for CoreType {
    fn default() -> Self {
        CoreType::Unknown
    }
}

/// A small max-heap over a core's logical CPUs, keyed by an SMT-aware
/// priority score (§4.8). SMT groups are small (2-8 siblings), so this
/// is a flat `Vec` rescanned on update rather than a generic binary
/// heap; `peek_max`/`update` are both O(group size).
#[derive(Debug, Clone, Default)]
pub struct CpuPriorityHeap {
    entries: Vec<(CpuId, u32)>,
}

impl CpuPriorityHeap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, cpu: CpuId, key: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|(c, _)| *c == cpu) {
            entry.1 = key;
        } else {
            self.entries.push((cpu, key));
        }
    }

    pub fn remove(&mut self, cpu: CpuId) {
        self.entries.retain(|(c, _)| *c != cpu);
    }

    pub fn update_key(&mut self, cpu: CpuId, key: u32) {
        self.insert(cpu, key);
    }

    /// Highest-key CPU (lowest effective SMT load), if any.
    pub fn peek_max(&self) -> Option<CpuId> {
        self.entries.iter().max_by_key(|(_, k)| *k).map(|(c, _)| *c)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, u32)> + '_ {
        self.entries.iter().copied()
    }

    pub fn key_of(&self, cpu: CpuId) -> Option<u32> {
        self.entries.iter().find(|(c, _)| *c == cpu).map(|(_, k)| *k)
    }
}

/// A logical CPU: one schedulable execution context. SMT siblings are
/// distinct `CpuRecord`s sharing the same `core`.
#[derive(Debug, Clone)]
pub struct CpuRecord {
    pub cpu_id: CpuId,
    pub core: CoreId,
    pub enabled: bool,
}

/// A physical core, possibly with SMT siblings (spec §3.4).
#[derive(Debug, Clone)]
pub struct CoreRecord {
    pub core_id: CoreId,
    pub package: PackageId,
    pub cpu_set: CpuMask,
    pub cpu_count: u32,
    pub idle_cpu_count: u32,
    pub core_type: CoreType,
    pub performance_capacity: u32,
    pub energy_efficiency: u32,
    pub load: u32,
    pub instantaneous_load_q16: u32,
    pub high_load: bool,
    pub load_epoch: u64,
    pub cpu_heap: CpuPriorityHeap,
    /// Sum of the `needed_load` (§3.1) of every thread whose
    /// `home_core` is this core; moved between cores on migration
    /// (§4.6 step 4) rather than recomputed from scratch.
    pub needed_load: u32,
    /// No enabled CPUs remain on this core.
    pub defunct: bool,
}

impl CoreRecord {
    pub fn new(core_id: CoreId, package: PackageId) -> Self {
        CoreRecord {
            core_id,
            package,
            cpu_set: CpuMask::empty(),
            cpu_count: 0,
            idle_cpu_count: 0,
            core_type: CoreType::Unknown,
            performance_capacity: NOMINAL_CAPACITY,
            energy_efficiency: 0,
            load: 0,
            instantaneous_load_q16: 0,
            high_load: false,
            load_epoch: 0,
            cpu_heap: CpuPriorityHeap::new(),
            needed_load: 0,
            defunct: false,
        }
    }
}

/// A NUMA package / socket (spec §3.5).
#[derive(Debug, Clone)]
pub struct PackageRecord {
    pub package_id: PackageId,
    pub cores: Vec<CoreId>,
    pub idle_cores: Vec<CoreId>,
}

impl PackageRecord {
    pub fn new(package_id: PackageId) -> Self {
        PackageRecord { package_id, cores: Vec::new(), idle_cores: Vec::new() }
    }
}

/// The full topology: arenas of CPUs, cores, and packages plus the
/// structural edges between them. This is the only place cpu/core/
/// package relationships are stored; everything else refers to them
/// by index (spec §9 redesign flag).
pub struct Topology {
    cpus: Arena<CpuRecord>,
    cores: Arena<CoreRecord>,
    packages: Arena<PackageRecord>,
    idle_packages: Vec<PackageId>,
}

impl Topology {
    pub fn new() -> Self {
        Topology {
            cpus: Arena::new(),
            cores: Arena::new(),
            packages: Arena::new(),
            idle_packages: Vec::new(),
        }
    }

    pub fn add_package(&mut self) -> PackageId {
        let idx = self.packages.insert(PackageRecord::new(PackageId::new(0)));
        let id = PackageId::new(idx as usize);
        self.packages.get_mut(idx).unwrap().package_id = id;
        id
    }

    pub fn add_core(&mut self, package: PackageId, core_type: CoreType, performance_capacity: u32, energy_efficiency: u32) -> CoreId {
        let idx = self.cores.insert(CoreRecord::new(CoreId::new(0), package));
        let id = CoreId::new(idx as usize);
        let core = self.cores.get_mut(idx).unwrap();
        core.core_id = id;
        core.core_type = core_type;
        core.performance_capacity = performance_capacity;
        core.energy_efficiency = energy_efficiency;
        if let Some(pkg) = self.packages.get_mut(package.index() as u32) {
            pkg.cores.push(id);
        }
        id
    }

    pub fn add_cpu(&mut self, core: CoreId) -> CpuId {
        let idx = self.cpus.insert(CpuRecord { cpu_id: CpuId::new(0), core, enabled: true });
        let id = CpuId::new(idx as usize);
        self.cpus.get_mut(idx).unwrap().cpu_id = id;
        if let Some(core_rec) = self.cores.get_mut(core.index() as u32) {
            core_rec.cpu_set.set(id);
            core_rec.cpu_count += 1;
            core_rec.idle_cpu_count += 1;
            core_rec.cpu_heap.insert(id, 0);
        }
        id
    }

    pub fn cpu(&self, cpu: CpuId) -> Option<&CpuRecord> {
        self.cpus.get(cpu.index() as u32)
    }

    pub fn cpu_mut(&mut self, cpu: CpuId) -> Option<&mut CpuRecord> {
        self.cpus.get_mut(cpu.index() as u32)
    }

    pub fn core(&self, core: CoreId) -> Option<&CoreRecord> {
        self.cores.get(core.index() as u32)
    }

    pub fn core_mut(&mut self, core: CoreId) -> Option<&mut CoreRecord> {
        self.cores.get_mut(core.index() as u32)
    }

    pub fn package(&self, package: PackageId) -> Option<&PackageRecord> {
        self.packages.get(package.index() as u32)
    }

    pub fn package_mut(&mut self, package: PackageId) -> Option<&mut PackageRecord> {
        self.packages.get_mut(package.index() as u32)
    }

    pub fn cores_iter(&self) -> impl Iterator<Item = (u32, &CoreRecord)> {
        self.cores.iter()
    }

    pub fn cpus_on_core<'a>(&'a self, core: CoreId) -> impl Iterator<Item = CpuId> + 'a {
        self.core(core).into_iter().flat_map(|c| c.cpu_set.iter_set())
    }

    pub fn siblings_of<'a>(&'a self, cpu: CpuId) -> impl Iterator<Item = CpuId> + 'a {
        let core = self.cpu(cpu).map(|c| c.core);
        core.into_iter().flat_map(move |core| self.cpus_on_core(core)).filter(move |c| *c != cpu)
    }

    /// Marks a CPU enabled/disabled, keeping the core's idle/defunct
    /// bookkeeping consistent (spec §6 `set_cpu_enabled`).
    pub fn set_cpu_enabled(&mut self, cpu: CpuId, enabled: bool) {
        let core_id = match self.cpu(cpu) {
            Some(c) => c.core,
            None => return,
        };
        if let Some(rec) = self.cpu_mut(cpu) {
            rec.enabled = enabled;
        }
        let siblings: Vec<CpuId> = self.cpus_on_core(core_id).collect();
        let any_enabled = siblings.iter().any(|c| self.cpu(*c).map(|r| r.enabled).unwrap_or(false));
        if let Some(core) = self.core_mut(core_id) {
            core.defunct = !any_enabled;
        }
    }

    /// Adds `amount` to a core's `needed_load` aggregate, clamped at
    /// `u32::MAX`. A no-op if `core` is unknown.
    pub fn add_needed_load(&mut self, core: CoreId, amount: u32) {
        if let Some(rec) = self.core_mut(core) {
            rec.needed_load = rec.needed_load.saturating_add(amount);
        }
    }

    /// Subtracts `amount` from a core's `needed_load` aggregate,
    /// floored at zero. A no-op if `core` is unknown.
    pub fn remove_needed_load(&mut self, core: CoreId, amount: u32) {
        if let Some(rec) = self.core_mut(core) {
            rec.needed_load = rec.needed_load.saturating_sub(amount);
        }
    }

    pub fn idle_packages(&self) -> &[PackageId] {
        &self.idle_packages
    }

    pub fn mark_package_idle(&mut self, package: PackageId) {
        if !self.idle_packages.contains(&package) {
            self.idle_packages.push(package);
        }
    }

    pub fn mark_package_busy(&mut self, package: PackageId) {
        self.idle_packages.retain(|p| *p != package);
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_two_core_smt_topology() -> (Topology, CoreId, CoreId) {
        let mut topo = Topology::new();
        let pkg = topo.add_package();
        let core_a = topo.add_core(pkg, CoreType::Uniform, NOMINAL_CAPACITY, 0);
        let core_b = topo.add_core(pkg, CoreType::Uniform, NOMINAL_CAPACITY, 0);
        topo.add_cpu(core_a);
        topo.add_cpu(core_a); // SMT sibling
        topo.add_cpu(core_b);
        (topo, core_a, core_b)
    }

    #[test]
    fn smt_siblings_share_core_but_not_each_other() {
        let (topo, core_a, _core_b) = build_two_core_smt_topology();
        let cpus: alloc::vec::Vec<_> = topo.cpus_on_core(core_a).collect();
        assert_eq!(cpus.len(), 2);
        let sib: alloc::vec::Vec<_> = topo.siblings_of(cpus[0]).collect();
        assert_eq!(sib, alloc::vec![cpus[1]]);
    }

    #[test]
    fn disabling_sole_cpu_on_core_marks_it_defunct() {
        let (mut topo, _core_a, core_b) = build_two_core_smt_topology();
        let cpu = topo.cpus_on_core(core_b).next().unwrap();
        topo.set_cpu_enabled(cpu, false);
        assert!(!topo.cpu(cpu).unwrap().enabled);
        assert!(topo.core(core_b).unwrap().defunct);
    }

    #[test]
    fn disabling_one_smt_sibling_leaves_core_alive() {
        let (mut topo, core_a, _core_b) = build_two_core_smt_topology();
        let cpus: alloc::vec::Vec<_> = topo.cpus_on_core(core_a).collect();
        topo.set_cpu_enabled(cpus[0], false);
        assert!(!topo.core(core_a).unwrap().defunct);
    }

    #[test]
    fn needed_load_moves_between_cores() {
        let (mut topo, core_a, core_b) = build_two_core_smt_topology();
        topo.add_needed_load(core_a, 300);
        assert_eq!(topo.core(core_a).unwrap().needed_load, 300);
        topo.remove_needed_load(core_a, 300);
        topo.add_needed_load(core_b, 300);
        assert_eq!(topo.core(core_a).unwrap().needed_load, 0);
        assert_eq!(topo.core(core_b).unwrap().needed_load, 300);
    }

    #[test]
    fn cpu_priority_heap_peek_max_returns_highest_key() {
        let mut heap = CpuPriorityHeap::new();
        heap.insert(CpuId::new(0), 10);
        heap.insert(CpuId::new(1), 50);
        heap.insert(CpuId::new(2), 30);
        assert_eq!(heap.peek_max(), Some(CpuId::new(1)));
    }

    #[test]
    fn cpu_priority_heap_update_changes_max() {
        let mut heap = CpuPriorityHeap::new();
        heap.insert(CpuId::new(0), 10);
        heap.insert(CpuId::new(1), 20);
        heap.update_key(CpuId::new(0), 100);
        assert_eq!(heap.peek_max(), Some(CpuId::new(0)));
    }
}
