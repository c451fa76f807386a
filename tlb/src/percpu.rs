//! PerCpuTLB: one CPU's LRU-replaced entry array.
//!
//! Entries are owned exclusively by the CPU's TLB; `TLBSystem` never hands
//! out a reference that outlives a lock hold, matching the "no cyclic
//! references" design note.

use crate::entry::{AccessKind, Protection, TlbEntry};

/// A single CPU's translation cache: a flat array scanned linearly on every
/// lookup, matching the small, fixed capacities real TLBs use (tens of
/// entries, not thousands) where a linear scan beats the bookkeeping of a
/// hashed structure.
#[derive(Debug)]
pub struct PerCpuTlb {
    entries: Vec<TlbEntry>,
    sequence: u64,
    hits: u64,
    misses: u64,
}

impl PerCpuTlb {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: vec![TlbEntry::invalid(); capacity],
            sequence: 0,
            hits: 0,
            misses: 0,
        }
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Find a matching valid entry, checking permission for `access`.
    /// Bumps `last_used` on hit.
    pub fn find(
        &mut self,
        vpage: u64,
        asn: u32,
        instruction: bool,
        access: AccessKind,
        privileged: bool,
    ) -> Option<TlbEntry> {
        let Some(idx) = self.entries.iter().position(|e| e.matches(vpage, asn, instruction)) else {
            self.misses += 1;
            return None;
        };
        if !self.entries[idx].permits(access, privileged) {
            self.misses += 1;
            return None;
        }
        let seq = self.next_sequence();
        self.entries[idx].last_used = seq;
        self.entries[idx].access_count += 1;
        self.hits += 1;
        Some(self.entries[idx])
    }

    /// Insert a new entry, preferring an invalid slot, otherwise evicting
    /// the entry with the lowest `last_used` (ties broken by lowest index).
    pub fn insert(&mut self, mut entry: TlbEntry) {
        let seq = self.next_sequence();
        entry.last_used = seq;

        if let Some(idx) = self.entries.iter().position(|e| !e.valid) {
            self.entries[idx] = entry;
            return;
        }

        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(idx, e)| (e.last_used, *idx))
            .map(|(idx, _)| idx)
            .expect("capacity is never zero");
        self.entries[victim] = entry;
    }

    pub fn invalidate_all(&mut self) {
        for e in &mut self.entries {
            e.valid = false;
        }
    }

    /// Invalidate non-global entries tagged with `asn` (invariant I3).
    pub fn invalidate_asn(&mut self, asn: u32) {
        for e in &mut self.entries {
            if e.valid && !e.global && e.asn == asn {
                e.valid = false;
            }
        }
    }

    pub fn invalidate_address(&mut self, vpage: u64, asn: Option<u32>) {
        for e in &mut self.entries {
            if !e.valid || e.virtual_page != vpage {
                continue;
            }
            match asn {
                Some(asn) if !e.global && e.asn != asn => continue,
                _ => e.valid = false,
            }
        }
    }

    pub fn invalidate_instruction_kind(&mut self, is_instruction: bool) {
        for e in &mut self.entries {
            if e.valid && e.instruction == is_instruction {
                e.valid = false;
            }
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Test/diagnostic access to the raw entry slots.
    pub fn entries(&self) -> &[TlbEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Granularity;

    fn entry(vpage: u64, pa: u64, asn: u32, global: bool) -> TlbEntry {
        TlbEntry::new(vpage, pa, asn, Protection::all(), false, false, Granularity::G8Kb, global)
    }

    /// Spec scenario 1: single-CPU happy path.
    #[test]
    fn scenario_single_cpu_happy_path() {
        let mut tlb = PerCpuTlb::new(64);
        tlb.insert(entry(0x0000_0000_1000_0000, 0x0000_0000_4000_0000, 7, false));
        let hit = tlb
            .find(0x0000_0000_1000_0000, 7, false, AccessKind::Read, false)
            .expect("must hit");
        assert_eq!(hit.physical_for(0x0000_0000_1000_0040), 0x0000_0000_4000_0040);
        assert_eq!(tlb.hits(), 1);
    }

    /// Spec scenario 2: ASN flush leaves global entries intact.
    #[test]
    fn scenario_asn_flush() {
        let mut tlb = PerCpuTlb::new(64);
        tlb.insert(entry(0x1_0000, 0x4000_0000, 7, false));
        tlb.insert(entry(0x1_0000, 0x5000, 0, true));

        tlb.invalidate_asn(7);

        assert!(tlb.find(0x1_0000, 7, false, AccessKind::Read, false).is_none());
        assert!(tlb.find(0x1_0000, 0, false, AccessKind::Read, false).is_some());
    }

    #[test]
    fn eviction_prefers_lowest_last_used() {
        let mut tlb = PerCpuTlb::new(2);
        tlb.insert(entry(0x1000, 0x1000, 0, false));
        tlb.insert(entry(0x2000, 0x2000, 0, false));
        // Touch the first entry so the second becomes the LRU victim.
        tlb.find(0x1000, 0, false, AccessKind::Read, false);
        tlb.insert(entry(0x3000, 0x3000, 0, false));

        assert!(tlb.find(0x1000, 0, false, AccessKind::Read, false).is_some());
        assert!(tlb.find(0x2000, 0, false, AccessKind::Read, false).is_none());
        assert!(tlb.find(0x3000, 0, false, AccessKind::Read, false).is_some());
    }

    #[test]
    fn invalidate_instruction_kind_only_affects_matching_entries() {
        let mut tlb = PerCpuTlb::new(4);
        let mut data = entry(0x1000, 0x1000, 0, false);
        data.instruction = false;
        let mut code = entry(0x2000, 0x2000, 0, false);
        code.instruction = true;
        tlb.insert(data);
        tlb.insert(code);

        tlb.invalidate_instruction_kind(true);

        pretty_assertions::assert_eq!(tlb.find(0x1000, 0, false, AccessKind::Read, false).is_some(), true);
        pretty_assertions::assert_eq!(tlb.find(0x2000, 0, true, AccessKind::Execute, false).is_some(), false);
    }

    proptest::proptest! {
        /// P1: inserting a valid entry and immediately looking it up with
        /// the same (VA, ASN, access) returns that entry.
        #[test]
        fn insert_then_lookup_roundtrips(
            vpage in 0u64..(1u64 << 30),
            asn in 0u32..4096,
        ) {
            let mut tlb = PerCpuTlb::new(8);
            let va = vpage << 13;
            tlb.insert(entry(va, va.wrapping_add(0x1000), asn, false));
            let hit = tlb.find(va, asn, false, AccessKind::Read, false);
            prop_assert!(hit.is_some());
            prop_assert_eq!(hit.unwrap().virtual_page, va);
        }

        /// P3: after `invalidate_asn(a)`, no valid non-global entry with
        /// ASN=a remains findable.
        #[test]
        fn invalidate_asn_clears_matching_entries(
            vpage in 0u64..(1u64 << 30),
            asn in 0u32..4096,
        ) {
            let mut tlb = PerCpuTlb::new(8);
            let va = vpage << 13;
            tlb.insert(entry(va, va.wrapping_add(0x1000), asn, false));
            tlb.invalidate_asn(asn);
            prop_assert!(tlb.find(va, asn, false, AccessKind::Read, false).is_none());
        }
    }
}
