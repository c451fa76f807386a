//! External collaborator traits.
//!
//! The translation core is driven by, and drives, these interfaces. None of
//! them are implemented here; a simulator embeds concrete implementations
//! and passes them in at construction.

use axp_abi::PhysAddr;

/// Byte-addressable physical memory, as seen by the page-table walker.
///
/// Page-table entries are 64-bit little-endian values at
/// `ptbr_base + index * 8`.
pub trait MemoryBackend: Send + Sync {
    fn read_phys_u64(&self, addr: PhysAddr) -> u64;
    fn write_phys_u64(&self, addr: PhysAddr, value: u64);

    /// Establish a locked-load reservation on the cache line containing
    /// `addr`, for `cpu_id`.
    fn read_phys_u64_locked(&self, addr: PhysAddr, cpu_id: u32) -> u64 {
        self.read_phys_u64(addr)
    }

    /// Store-conditional: succeeds (returns `true`) only if no external
    /// write touched the reserved line since the matching locked load.
    fn write_phys_u64_conditional(&self, addr: PhysAddr, value: u64, cpu_id: u32) -> bool {
        self.write_phys_u64(addr, value);
        let _ = cpu_id;
        true
    }
}

/// Current privilege mode of a CPU agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivilegeLevel {
    Kernel,
    User,
}

/// The CPU side of the translation boundary: supplies translation context,
/// receives faults.
pub trait CpuAgent: Send + Sync {
    fn privilege_level(&self, cpu_id: u32) -> PrivilegeLevel;
    fn current_asn(&self, cpu_id: u32) -> u32;
    /// Page-table base register, already shifted to a page-frame number.
    fn ptbr_pfn(&self, cpu_id: u32) -> u64;

    fn on_fault(&self, cpu_id: u32, fault: crate::faults::FaultKind, va: u64, pid: u32);
}

/// Typed cache-hierarchy request kinds, issued by `TlbCacheIntegrator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    Read,
    Write,
    Prefetch,
    Invalidate,
    Flush,
    Writeback,
}

/// MESI(+Owned) coherency states reported back by the cache hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
    Owned,
}

/// Outcome of a cache-hierarchy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOutcome {
    pub hit: bool,
    pub level: u8,
    pub state: CoherencyState,
}

/// Per-CPU L1/L2 plus shared L3/LLC cache hierarchy, as seen by the
/// integrator.
pub trait CacheController: Send + Sync {
    fn lookup(&self, pa: PhysAddr) -> CacheOutcome;
    fn write(&self, pa: PhysAddr) -> CacheOutcome;
    fn prefetch(&self, pa: PhysAddr);
    fn invalidate(&self, pa: PhysAddr);
}
