//! TLBEntry: a single translation record.
//!
//! A plain value type carrying the attributes named in the data model: the
//! virtual/physical page pair, ASN, protection, mode flags, granularity, and
//! the bookkeeping fields `PerCpuTLB` and `TranslationCache` need for LRU
//! replacement.

use bitflags::bitflags;
use core::fmt;

bitflags! {
    /// Access permissions a translation grants.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Protection: u8 {
        const READ    = 1 << 0;
        const WRITE   = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

/// Access kind requested by a translation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl AccessKind {
    fn required(self) -> Protection {
        match self {
            Self::Read => Protection::READ,
            Self::Write => Protection::WRITE,
            Self::Execute => Protection::EXECUTE,
        }
    }
}

/// Page-granularity hint, per the Alpha AXP encoding of the PTE's
/// granularity bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// 8 KiB, granularity bits `00`.
    G8Kb,
    /// 64 KiB, granularity bits `01`.
    G64Kb,
    /// 4 MiB, granularity bits `10`.
    G4Mb,
    /// 256 MiB, granularity bits `11`.
    G256Mb,
}

impl Granularity {
    /// Decode the two granularity bits of a PTE.
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => Self::G8Kb,
            1 => Self::G64Kb,
            2 => Self::G4Mb,
            _ => Self::G256Mb,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Self::G8Kb => 0,
            Self::G64Kb => 1,
            Self::G4Mb => 2,
            Self::G256Mb => 3,
        }
    }

    /// Page offset width in bits: 13 / 16 / 22 / 28.
    pub const fn offset_bits(self) -> u32 {
        match self {
            Self::G8Kb => 13,
            Self::G64Kb => 16,
            Self::G4Mb => 22,
            Self::G256Mb => 28,
        }
    }

    pub const fn page_size(self) -> u64 {
        1u64 << self.offset_bits()
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::G8Kb => "8KiB",
            Self::G64Kb => "64KiB",
            Self::G4Mb => "4MiB",
            Self::G256Mb => "256MiB",
        };
        f.write_str(name)
    }
}

/// A single translation: virtual page to physical page, with tags.
///
/// `instruction` records whether this entry was installed for an instruction
/// fetch (the "instruction kind" bit named in the data model); there is no
/// separate instruction/data TLB split — see the design notes on why a
/// single flag was chosen over a split structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbEntry {
    pub virtual_page: u64,
    pub physical_page: u64,
    pub asn: u32,
    pub protection: Protection,
    pub kernel_only: bool,
    pub instruction: bool,
    pub granularity: Granularity,
    pub global: bool,
    pub valid: bool,
    pub access_count: u64,
    pub last_used: u64,
}

impl TlbEntry {
    /// Build a fresh, valid entry. `virtual_page`/`physical_page` are
    /// truncated to the entry's granularity (invariant I1).
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        virtual_page: u64,
        physical_page: u64,
        asn: u32,
        protection: Protection,
        kernel_only: bool,
        instruction: bool,
        granularity: Granularity,
        global: bool,
    ) -> Self {
        let mask = !(granularity.page_size() - 1);
        Self {
            virtual_page: virtual_page & mask,
            physical_page: physical_page & mask,
            asn,
            protection,
            kernel_only,
            instruction,
            granularity,
            global,
            valid: true,
            access_count: 0,
            last_used: 0,
        }
    }

    /// An invalid, all-zero slot occupant.
    pub const fn invalid() -> Self {
        Self {
            virtual_page: 0,
            physical_page: 0,
            asn: 0,
            protection: Protection::empty(),
            kernel_only: false,
            instruction: false,
            granularity: Granularity::G8Kb,
            global: false,
            valid: false,
            access_count: 0,
            last_used: 0,
        }
    }

    /// Whether `vpage` (already page-aligned) and `asn` match this entry,
    /// for the given instruction/data kind. Global entries ignore `asn`.
    pub fn matches(&self, vpage: u64, asn: u32, instruction: bool) -> bool {
        self.valid
            && self.instruction == instruction
            && self.virtual_page == vpage
            && (self.global || self.asn == asn)
    }

    /// Whether this entry grants `access` given the caller's privilege.
    pub fn permits(&self, access: AccessKind, privileged: bool) -> bool {
        if self.kernel_only && !privileged {
            return false;
        }
        self.protection.contains(access.required())
    }

    /// Reattach `va`'s page offset to this entry's physical page.
    pub fn physical_for(&self, va: u64) -> u64 {
        let offset = va & (self.granularity.page_size() - 1);
        self.physical_page | offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_truncates_to_granularity() {
        let e = TlbEntry::new(
            0x1234,
            0x5678,
            1,
            Protection::READ,
            false,
            false,
            Granularity::G8Kb,
            false,
        );
        assert_eq!(e.virtual_page, 0x1234 & !(0x2000 - 1));
        assert_eq!(e.physical_page, 0x5678 & !(0x2000 - 1));
    }

    #[test]
    fn global_entry_matches_any_asn() {
        let e = TlbEntry::new(
            0x1_0000,
            0x5000,
            0,
            Protection::all(),
            false,
            false,
            Granularity::G8Kb,
            true,
        );
        assert!(e.matches(0x1_0000, 7, false));
        assert!(e.matches(0x1_0000, 99, false));
    }

    #[test]
    fn non_global_entry_requires_matching_asn() {
        let e = TlbEntry::new(
            0x1_0000,
            0x5000,
            7,
            Protection::all(),
            false,
            false,
            Granularity::G8Kb,
            false,
        );
        assert!(e.matches(0x1_0000, 7, false));
        assert!(!e.matches(0x1_0000, 8, false));
    }

    #[test]
    fn permits_checks_kernel_only() {
        let e = TlbEntry::new(
            0,
            0,
            0,
            Protection::READ | Protection::WRITE,
            true,
            false,
            Granularity::G8Kb,
            false,
        );
        assert!(e.permits(AccessKind::Read, true));
        assert!(!e.permits(AccessKind::Read, false));
        assert!(!e.permits(AccessKind::Execute, true));
    }

    #[test]
    fn physical_for_reattaches_offset() {
        let e = TlbEntry::new(
            0x0000_0000_1000_0000,
            0x0000_0000_4000_0000,
            7,
            Protection::all(),
            false,
            false,
            Granularity::G8Kb,
            false,
        );
        assert_eq!(e.physical_for(0x0000_0000_1000_0040), 0x0000_0000_4000_0040);
    }

    proptest::proptest! {
        /// P2: for any entry and any VA within its page, `physical_for`
        /// equals the entry's physical page with that VA's offset reattached.
        #[test]
        fn physical_for_matches_page_plus_offset(
            vpage in 0u64..(1u64 << 40),
            ppage in 0u64..(1u64 << 40),
            offset in 0u64..0x2000,
            asn in 0u32..4096,
        ) {
            let e = TlbEntry::new(
                vpage << 13,
                ppage << 13,
                asn,
                Protection::all(),
                false,
                false,
                Granularity::G8Kb,
                false,
            );
            let va = e.virtual_page | offset;
            prop_assert_eq!(e.physical_for(va), e.physical_page | offset);
        }
    }
}
