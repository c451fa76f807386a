//! Address newtypes shared between the translation core and its embedders.
//!
//! Keeping physical and virtual addresses as distinct types prevents the
//! classic confusion of passing one where the other is expected. Both are
//! zero-cost `#[repr(transparent)]` wrappers around `u64`.

pub mod addr;

/// Smallest page granularity recognized by the translator (8 KiB, per the
/// Alpha AXP granularity-hint encoding's narrowest setting).
pub const MIN_PAGE_SIZE: u64 = 8 * 1024;

pub use addr::{PhysAddr, VirtAddr};
