//! Unified error type for the translation subsystem.
//!
//! Every component that can fail returns `TranslationResult`. Variants are
//! organized by the subsystem that typically produces them, but any
//! operation may return any variant.

use crate::pagetable::PageTableLevel;
use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationError {
    /// Virtual address failed the canonicality check.
    NonCanonicalAddress { address: u64 },
    /// Walk reached a level whose PTE has the valid bit clear.
    InvalidPte { level: PageTableLevel },
    /// PTE's fault-on-read bit is set for a read access.
    ProtectionRead { address: u64 },
    /// PTE's fault-on-write bit is set for a write access.
    ProtectionWrite { address: u64 },
    /// PTE's fault-on-execute bit is set for an execute access.
    ProtectionExec { address: u64 },
    /// Entry requires kernel privilege but the access was made from user mode.
    PrivilegeViolation { address: u64 },
    /// CPU id exceeds `Config::tlb_max_cpus` or is already registered.
    CpuAlreadyRegistered { cpu_id: u32 },
    /// CPU id was never registered.
    CpuNotRegistered { cpu_id: u32 },
    /// Collision detector has no free slot for a new in-flight operation.
    CollisionTableFull,
    /// Pipeline coordinator's active-operations queue is at `max_depth`.
    PipelineQueueFull,
    /// An operation id referenced by `advance`/`stall`/`unstall` is unknown.
    UnknownOperation { op_id: u64 },
    /// A stalled operation exceeded `coordinator.stall_timeout_ms` and its
    /// replay budget.
    ReplayExhausted { op_id: u64 },
}

impl fmt::Display for TranslationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NonCanonicalAddress { address } => {
                write!(f, "virtual address {:#x} is not canonical", address)
            }
            Self::InvalidPte { level } => write!(f, "invalid page table entry at level {}", level),
            Self::ProtectionRead { address } => {
                write!(f, "read access to {:#x} denied by page protection", address)
            }
            Self::ProtectionWrite { address } => {
                write!(f, "write access to {:#x} denied by page protection", address)
            }
            Self::ProtectionExec { address } => write!(
                f,
                "execute access to {:#x} denied by page protection",
                address
            ),
            Self::PrivilegeViolation { address } => {
                write!(f, "access to {:#x} requires kernel privilege", address)
            }
            Self::CpuAlreadyRegistered { cpu_id } => {
                write!(f, "cpu {} is already registered", cpu_id)
            }
            Self::CpuNotRegistered { cpu_id } => write!(f, "cpu {} is not registered", cpu_id),
            Self::CollisionTableFull => write!(f, "collision detector has no free slot"),
            Self::PipelineQueueFull => write!(f, "pipeline active-operations queue is full"),
            Self::UnknownOperation { op_id } => write!(f, "unknown pipeline operation {}", op_id),
            Self::ReplayExhausted { op_id } => {
                write!(f, "operation {} exhausted its replay budget", op_id)
            }
        }
    }
}

pub type TranslationResult<T = ()> = Result<T, TranslationError>;
