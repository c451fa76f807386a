//! AddressTranslator: stateless virtual-address decoding plus atomic
//! translation statistics.
//!
//! Grounded on `original_source/AEJ/tlbaddresstranslator.h`: the same
//! canonicality check, index/tag/offset math and hit/miss atomics, adapted
//! from a fixed 4 KiB page size to the granularity-aware cache indexing the
//! spec's `TranslationCache` requires.

use crate::error::{TranslationError, TranslationResult};
use axp_abi::VirtAddr;
use core::sync::atomic::{AtomicU64, Ordering};

/// Stateless virtual-address decoding helpers, plus process-wide hit/miss
/// counters (atomic so they can be shared across threads without a lock).
#[derive(Debug, Default)]
pub struct AddressTranslator {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl AddressTranslator {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Canonicality check: bits 47..63 must sign-extend bit 47.
    pub fn validate(&self, va: u64) -> TranslationResult<()> {
        if VirtAddr::is_canonical(va) {
            Ok(())
        } else {
            Err(TranslationError::NonCanonicalAddress { address: va })
        }
    }

    #[inline]
    pub fn page_offset(&self, va: u64, page_size: u64) -> u64 {
        va & (page_size - 1)
    }

    #[inline]
    pub fn page_number(&self, va: u64, page_size: u64) -> u64 {
        va >> page_size.trailing_zeros()
    }

    /// Set index into a translation cache with `sets` sets (power of two).
    #[inline]
    pub fn tb_index(&self, va: u64, page_size: u64, sets: u64) -> u64 {
        self.page_number(va, page_size) & (sets - 1)
    }

    /// The remaining high bits of the page number, used as the per-set tag.
    #[inline]
    pub fn virtual_tag(&self, va: u64, page_size: u64, sets: u64) -> u64 {
        self.page_number(va, page_size) / sets
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    pub fn miss_ratio(&self) -> f64 {
        1.0 - self.hit_ratio()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_canonical_addresses() {
        let t = AddressTranslator::new();
        assert!(t.validate(0x0000_0000_1000_0000).is_ok());
        assert!(t.validate(0x0001_0000_0000_0000).is_err());
    }

    #[test]
    fn tb_index_wraps_with_set_count() {
        let t = AddressTranslator::new();
        let page_size = 0x2000u64;
        let sets = 16u64;
        let idx0 = t.tb_index(0x0000_0000, page_size, sets);
        let idx1 = t.tb_index(sets * page_size, page_size, sets);
        assert_eq!(idx0, idx1);
    }

    #[test]
    fn hit_ratio_tracks_recorded_outcomes() {
        let t = AddressTranslator::new();
        t.record_hit();
        t.record_hit();
        t.record_miss();
        assert!((t.hit_ratio() - (2.0 / 3.0)).abs() < 1e-9);
    }
}
