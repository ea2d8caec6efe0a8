//! Topology - SMT sibling layout
//!
//! CPUs are grouped into cores of `smt_threads` hardware threads with
//! contiguous ids: with 2 threads per core, CPUs 0-1 form core 0, 2-3 core 1.

use alloc::vec::Vec;

use super::cpumask::CpuMask;

/// Static CPU topology
#[derive(Debug, Clone)]
pub struct Topology {
    nr_cpus: u32,
    smt_threads: u32,
    /// Sibling mask per core
    cores: Vec<CpuMask>,
}

impl Topology {
    pub fn new(nr_cpus: u32, smt_threads: u32) -> Self {
        let smt_threads = smt_threads.max(1);
        let nr_cores = (nr_cpus + smt_threads - 1) / smt_threads;
        let cores = (0..nr_cores)
            .map(|core| {
                let first = core * smt_threads;
                let last = (first + smt_threads).min(nr_cpus);
                CpuMask::from_cpus(nr_cpus, first..last)
            })
            .collect();

        Self { nr_cpus, smt_threads, cores }
    }

    #[inline]
    pub fn nr_cpus(&self) -> u32 {
        self.nr_cpus
    }

    /// SMT is active when a core has more than one thread
    #[inline]
    pub fn smt_enabled(&self) -> bool {
        self.smt_threads > 1
    }

    #[inline]
    pub fn core_of(&self, cpu: u32) -> u32 {
        cpu / self.smt_threads
    }

    /// Siblings of `cpu`, including itself. Empty for an invalid CPU.
    pub fn smt_mask(&self, cpu: u32) -> CpuMask {
        self.cores
            .get(self.core_of(cpu) as usize)
            .copied()
            .unwrap_or_else(|| CpuMask::new(self.nr_cpus))
    }
}
