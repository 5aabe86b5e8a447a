//! Page-table entry layout and attribute encoding.
//!
//! Entries follow the VMSAv8-64 long-descriptor format with a 4 KiB granule:
//! a 64-bit word holding a 2-bit descriptor type, a page-aligned output
//! address, and permission/memory-type attributes. Attributes exist in two
//! encodings: stage 1 for kernel and user address spaces, and stage 2 for
//! guest (second-stage) address spaces.
//!
//! One of the architecture-reserved software bits is repurposed as an
//! accessed flag for non-terminal entries, which the hardware cannot
//! maintain itself; see [`Pte::is_table_accessed`].

use crate::{CachePolicy, MmuFlags, PhysicalAddress};

/// Log2 of the page size (4 KiB granule).
pub const PAGE_SIZE_SHIFT: usize = 12;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_SHIFT;

/// Number of entries in one page-table page (one 64-bit entry per 8 bytes).
pub(crate) const PTES_PER_TABLE: usize = PAGE_SIZE / 8;

/// Largest index shift at which a block (large-page) mapping may be installed.
/// Coarser levels must always recurse into a finer table.
pub(crate) const BLOCK_MAX_SHIFT: usize = 30;

/// Translation stage an address space's attributes are encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    /// Stage-1 translation (kernel and user address spaces).
    Stage1,
    /// Stage-2 translation (guest physical address spaces).
    Stage2,
}

// Descriptor type, bits [1:0].
const DESCRIPTOR_MASK: u64 = 0b11;
const DESCRIPTOR_INVALID: u64 = 0b00;
const DESCRIPTOR_BLOCK: u64 = 0b01;
const DESCRIPTOR_TABLE: u64 = 0b11;
const DESCRIPTOR_PAGE: u64 = 0b11;

/// Output address, bits [47:12].
const OUTPUT_ADDR_MASK: u64 = 0x0000_FFFF_FFFF_F000;

// Stage-1 lower attributes.
const ATTR_INDEX_MASK: u64 = 0b111 << 2;
const ATTR_NORMAL_MEMORY: u64 = 0 << 2;
const ATTR_NORMAL_UNCACHED: u64 = 1 << 2;
const ATTR_STRONGLY_ORDERED: u64 = 2 << 2;
const ATTR_DEVICE: u64 = 3 << 2;
const ATTR_AP_P_RW_U_NA: u64 = 0b00 << 6;
const ATTR_AP_P_RW_U_RW: u64 = 0b01 << 6;
const ATTR_AP_P_RO_U_NA: u64 = 0b10 << 6;
const ATTR_AP_P_RO_U_RO: u64 = 0b11 << 6;
const ATTR_AP_MASK: u64 = 0b11 << 6;
const ATTR_SH_INNER_SHAREABLE: u64 = 0b11 << 8;
const ATTR_AF: u64 = 1 << 10;
pub(crate) const ATTR_NON_GLOBAL: u64 = 1 << 11;

// Stage-1 upper attributes.
const ATTR_PXN: u64 = 1 << 53;
const ATTR_UXN: u64 = 1 << 54;

/// Software-defined bit used as the emulated accessed flag on non-terminal
/// entries. Bits [58:55] are ignored by the translation hardware.
const ATTR_SOFTWARE_AF: u64 = 1 << 55;

/// Attribute bits rewritten by a protect operation (stage 1).
const PERMISSION_MASK_S1: u64 = ATTR_AP_MASK | ATTR_UXN | ATTR_PXN;

// Stage-2 attributes. Memory type is encoded directly in MemAttr[5:2] rather
// than indirecting through an attribute index register.
const S2_ATTR_INDEX_MASK: u64 = 0b1111 << 2;
const S2_ATTR_STRONGLY_ORDERED: u64 = 0b0000 << 2;
const S2_ATTR_DEVICE: u64 = 0b0001 << 2;
const S2_ATTR_NORMAL_UNCACHED: u64 = 0b0101 << 2;
const S2_ATTR_NORMAL_MEMORY: u64 = 0b1111 << 2;
const S2_ATTR_S2AP_RO: u64 = 0b01 << 6;
const S2_ATTR_S2AP_RW: u64 = 0b11 << 6;
const S2_ATTR_S2AP_MASK: u64 = 0b11 << 6;
const S2_ATTR_XN: u64 = 1 << 54;

/// Attribute bits rewritten by a protect operation (stage 2).
const PERMISSION_MASK_S2: u64 = S2_ATTR_S2AP_MASK | S2_ATTR_XN;

/// One page-table entry.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Pte(u64);

impl Pte {
    /// The invalid (empty) entry.
    pub const INVALID: Pte = Pte(0);

    /// Returns whether the entry is valid (holds any live descriptor).
    pub const fn is_valid(self) -> bool {
        (self.0 & DESCRIPTOR_MASK) != DESCRIPTOR_INVALID
    }

    /// Returns whether the entry points at a next-level table. Only possible
    /// above the terminal level.
    pub const fn is_table(self, index_shift: usize) -> bool {
        index_shift > PAGE_SIZE_SHIFT && (self.0 & DESCRIPTOR_MASK) == DESCRIPTOR_TABLE
    }

    /// Returns whether the entry is a block (large-page) mapping. Only
    /// possible above the terminal level.
    pub const fn is_block(self, index_shift: usize) -> bool {
        index_shift > PAGE_SIZE_SHIFT && (self.0 & DESCRIPTOR_MASK) == DESCRIPTOR_BLOCK
    }

    /// Returns whether the entry terminally maps memory at this level: a
    /// block above the terminal level, or a page at it.
    pub const fn is_terminal(self, index_shift: usize) -> bool {
        let expected = if index_shift > PAGE_SIZE_SHIFT {
            DESCRIPTOR_BLOCK
        } else {
            DESCRIPTOR_PAGE
        };
        self.is_valid() && (self.0 & DESCRIPTOR_MASK) == expected
    }

    /// Returns the output address of the entry: the next table for table
    /// entries, the mapped base for block and page entries.
    pub const fn output_address(self) -> PhysicalAddress {
        PhysicalAddress::new((self.0 & OUTPUT_ADDR_MASK) as usize)
    }

    /// Returns the attribute bits, with descriptor and output address stripped.
    pub const fn attrs(self) -> u64 {
        self.0 & !(OUTPUT_ADDR_MASK | DESCRIPTOR_MASK)
    }

    /// Creates a table entry pointing at the given page-table page.
    pub fn table(next_table: PhysicalAddress) -> Pte {
        debug_assert!(next_table.is_aligned(PAGE_SIZE));
        Pte(next_table.as_usize() as u64 | DESCRIPTOR_TABLE)
    }

    /// Creates a block entry mapping a large physically contiguous range.
    pub fn block(base: PhysicalAddress, attrs: u64) -> Pte {
        debug_assert!(base.is_aligned(PAGE_SIZE));
        Pte(base.as_usize() as u64 | attrs | DESCRIPTOR_BLOCK)
    }

    /// Creates a terminal page entry.
    pub fn page(base: PhysicalAddress, attrs: u64) -> Pte {
        debug_assert!(base.is_aligned(PAGE_SIZE));
        Pte(base.as_usize() as u64 | attrs | DESCRIPTOR_PAGE)
    }

    /// Returns the entry with its permission attributes replaced, leaving the
    /// descriptor type and output address untouched.
    pub const fn with_permissions(self, attrs: u64, stage: Stage) -> Pte {
        Pte((self.0 & !permission_mask(stage)) | attrs)
    }

    /// Returns whether the hardware accessed flag is set.
    pub const fn is_accessed(self) -> bool {
        (self.0 & ATTR_AF) != 0
    }

    /// Returns the entry with the hardware accessed flag set.
    pub const fn set_accessed(self) -> Pte {
        Pte(self.0 | ATTR_AF)
    }

    /// Returns the entry with the hardware accessed flag cleared.
    pub const fn clear_accessed(self) -> Pte {
        Pte(self.0 & !ATTR_AF)
    }

    /// Returns whether the software accessed flag for non-terminal entries is set.
    pub const fn is_table_accessed(self) -> bool {
        (self.0 & ATTR_SOFTWARE_AF) != 0
    }

    /// Returns the entry with the software non-terminal accessed flag set.
    pub const fn set_table_accessed(self) -> Pte {
        Pte(self.0 | ATTR_SOFTWARE_AF)
    }

    /// Returns the entry with the software non-terminal accessed flag cleared.
    pub const fn clear_table_accessed(self) -> Pte {
        Pte(self.0 & !ATTR_SOFTWARE_AF)
    }
}

impl core::fmt::Debug for Pte {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Pte({:#018x})", self.0)
    }
}

/// Returns the attribute bits a protect operation rewrites for the given stage.
pub(crate) const fn permission_mask(stage: Stage) -> u64 {
    match stage {
        Stage::Stage1 => PERMISSION_MASK_S1,
        Stage::Stage2 => PERMISSION_MASK_S2,
    }
}

/// Converts mapping flags to PTE attribute bits for the given stage.
///
/// New mappings start with the accessed flag set, under the assumption they
/// are being installed because they are about to be used; this avoids an
/// immediate accessed fault.
pub(crate) fn attrs_from_flags(stage: Stage, flags: MmuFlags) -> u64 {
    match stage {
        Stage::Stage1 => stage1_attrs_from_flags(flags),
        Stage::Stage2 => stage2_attrs_from_flags(flags),
    }
}

/// Decodes PTE attribute bits back into mapping flags for the given stage.
pub(crate) fn flags_from_attrs(stage: Stage, attrs: u64) -> MmuFlags {
    match stage {
        Stage::Stage1 => stage1_flags_from_attrs(attrs),
        Stage::Stage2 => stage2_flags_from_attrs(attrs),
    }
}

fn stage1_attrs_from_flags(flags: MmuFlags) -> u64 {
    let mut attrs = ATTR_AF;

    match flags.cache_policy() {
        CachePolicy::Cached => attrs |= ATTR_NORMAL_MEMORY | ATTR_SH_INNER_SHAREABLE,
        CachePolicy::WriteCombining => attrs |= ATTR_NORMAL_UNCACHED | ATTR_SH_INNER_SHAREABLE,
        CachePolicy::Uncached => attrs |= ATTR_STRONGLY_ORDERED,
        CachePolicy::Device => attrs |= ATTR_DEVICE,
    }

    attrs |= match (flags.is_user(), flags.is_writable()) {
        (false, false) => ATTR_AP_P_RO_U_NA,
        (false, true) => ATTR_AP_P_RW_U_NA,
        (true, false) => ATTR_AP_P_RO_U_RO,
        (true, true) => ATTR_AP_P_RW_U_RW,
    };

    if !flags.is_executable() {
        attrs |= ATTR_UXN | ATTR_PXN;
    }

    attrs
}

fn stage1_flags_from_attrs(attrs: u64) -> MmuFlags {
    let mut flags = MmuFlags::empty();

    flags.set_cache_policy(match attrs & ATTR_INDEX_MASK {
        ATTR_NORMAL_MEMORY => CachePolicy::Cached,
        ATTR_NORMAL_UNCACHED => CachePolicy::WriteCombining,
        ATTR_STRONGLY_ORDERED => CachePolicy::Uncached,
        ATTR_DEVICE => CachePolicy::Device,
        _ => unreachable!("unhandled memory attribute index"),
    });

    // Every stage-1 access-permission encoding implies readability.
    flags.set_readable(true);
    match attrs & ATTR_AP_MASK {
        ATTR_AP_P_RW_U_NA => flags.set_writable(true),
        ATTR_AP_P_RW_U_RW => {
            flags.set_writable(true);
            flags.set_user(true);
        }
        ATTR_AP_P_RO_U_NA => {}
        ATTR_AP_P_RO_U_RO => flags.set_user(true),
        _ => unreachable!(),
    }

    if (attrs & ATTR_UXN) == 0 || (attrs & ATTR_PXN) == 0 {
        flags.set_executable(true);
    }

    flags
}

fn stage2_attrs_from_flags(flags: MmuFlags) -> u64 {
    let mut attrs = ATTR_AF;

    match flags.cache_policy() {
        CachePolicy::Cached => attrs |= S2_ATTR_NORMAL_MEMORY | ATTR_SH_INNER_SHAREABLE,
        CachePolicy::WriteCombining => attrs |= S2_ATTR_NORMAL_UNCACHED | ATTR_SH_INNER_SHAREABLE,
        CachePolicy::Uncached => attrs |= S2_ATTR_STRONGLY_ORDERED,
        CachePolicy::Device => attrs |= S2_ATTR_DEVICE,
    }

    if flags.is_writable() {
        attrs |= S2_ATTR_S2AP_RW;
    } else {
        attrs |= S2_ATTR_S2AP_RO;
    }
    if !flags.is_executable() {
        attrs |= S2_ATTR_XN;
    }

    attrs
}

fn stage2_flags_from_attrs(attrs: u64) -> MmuFlags {
    let mut flags = MmuFlags::empty();

    flags.set_cache_policy(match attrs & S2_ATTR_INDEX_MASK {
        S2_ATTR_NORMAL_MEMORY => CachePolicy::Cached,
        S2_ATTR_NORMAL_UNCACHED => CachePolicy::WriteCombining,
        S2_ATTR_STRONGLY_ORDERED => CachePolicy::Uncached,
        S2_ATTR_DEVICE => CachePolicy::Device,
        _ => unreachable!("unhandled stage-2 memory attribute"),
    });

    flags.set_readable(true);
    if (attrs & S2_ATTR_S2AP_MASK) == S2_ATTR_S2AP_RW {
        flags.set_writable(true);
    }
    if (attrs & S2_ATTR_XN) == 0 {
        flags.set_executable(true);
    }

    flags
}

/// One page-table page: an array of entries occupying exactly one page.
///
/// Tables are shared with the hardware translation-table walker, so all entry
/// accesses are volatile.
#[repr(C, align(4096))]
pub(crate) struct PageTable {
    entries: [Pte; PTES_PER_TABLE],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == PAGE_SIZE);

impl PageTable {
    /// Creates an empty page table with every entry invalid.
    #[cfg(test)]
    pub const fn empty() -> Self {
        Self {
            entries: [Pte::INVALID; PTES_PER_TABLE],
        }
    }

    /// Returns the entry at the given index.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn entry(&self, index: usize) -> Pte {
        assert!(index < PTES_PER_TABLE, "page table index out of bounds");
        // SAFETY: In-bounds read of an initialized entry; volatile because the
        // hardware walker may be accessing the same memory.
        unsafe { core::ptr::read_volatile(&self.entries[index]) }
    }

    /// Stores the entry at the given index.
    ///
    /// # Panics
    /// Panics if `index` is out of bounds.
    pub fn set_entry(&mut self, index: usize, pte: Pte) {
        assert!(index < PTES_PER_TABLE, "page table index out of bounds");
        // SAFETY: In-bounds write; volatile because the hardware walker may be
        // accessing the same memory.
        unsafe { core::ptr::write_volatile(&mut self.entries[index], pte) }
    }

    /// Returns whether every entry in the table is invalid.
    pub fn is_clear(&self) -> bool {
        for i in 0..PTES_PER_TABLE {
            if self.entry(i).is_valid() {
                log::trace!("page table still in use, index {} is {:?}", i, self.entry(i));
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw_flags() -> MmuFlags {
        let mut flags = MmuFlags::empty();
        flags.set_readable(true);
        flags.set_writable(true);
        flags
    }

    #[test]
    fn invalid_entry() {
        let pte = Pte::INVALID;
        assert!(!pte.is_valid());
        assert!(!pte.is_table(39));
        assert!(!pte.is_block(21));
        assert!(!pte.is_terminal(PAGE_SIZE_SHIFT));
    }

    #[test]
    fn table_entry() {
        let pte = Pte::table(PhysicalAddress::new(0x4_2000));
        assert!(pte.is_valid());
        assert!(pte.is_table(21));
        assert!(!pte.is_table(PAGE_SIZE_SHIFT));
        assert_eq!(pte.output_address(), PhysicalAddress::new(0x4_2000));
    }

    #[test]
    fn block_and_page_entries() {
        let attrs = attrs_from_flags(Stage::Stage1, rw_flags());

        let block = Pte::block(PhysicalAddress::new(0x20_0000), attrs);
        assert!(block.is_block(21));
        assert!(block.is_terminal(21));
        assert!(!block.is_terminal(PAGE_SIZE_SHIFT));

        let page = Pte::page(PhysicalAddress::new(0x1000), attrs);
        assert!(page.is_terminal(PAGE_SIZE_SHIFT));
        assert!(!page.is_block(PAGE_SIZE_SHIFT));
        assert_eq!(page.output_address(), PhysicalAddress::new(0x1000));
    }

    #[test]
    fn accessed_flags() {
        let attrs = attrs_from_flags(Stage::Stage1, rw_flags());
        let pte = Pte::page(PhysicalAddress::new(0x1000), attrs);

        // New mappings start accessed.
        assert!(pte.is_accessed());
        let cleared = pte.clear_accessed();
        assert!(!cleared.is_accessed());
        assert!(cleared.set_accessed().is_accessed());

        let table = Pte::table(PhysicalAddress::new(0x2000));
        assert!(!table.is_table_accessed());
        let marked = table.set_table_accessed();
        assert!(marked.is_table_accessed());
        assert!(!marked.clear_table_accessed().is_table_accessed());
        // The software flag lives outside the output-address field.
        assert_eq!(marked.output_address(), table.output_address());
    }

    mod stage1 {
        use super::*;

        #[test]
        fn flags_round_trip() {
            for user in [false, true] {
                for write in [false, true] {
                    for execute in [false, true] {
                        let mut flags = MmuFlags::empty();
                        flags.set_readable(true);
                        flags.set_user(user);
                        flags.set_writable(write);
                        flags.set_executable(execute);

                        let attrs = attrs_from_flags(Stage::Stage1, flags);
                        assert_eq!(flags_from_attrs(Stage::Stage1, attrs), flags);
                    }
                }
            }
        }

        #[test]
        fn cache_policy_round_trip() {
            for policy in [
                CachePolicy::Cached,
                CachePolicy::WriteCombining,
                CachePolicy::Uncached,
                CachePolicy::Device,
            ] {
                let mut flags = MmuFlags::empty();
                flags.set_readable(true);
                flags.set_cache_policy(policy);

                let attrs = attrs_from_flags(Stage::Stage1, flags);
                assert_eq!(flags_from_attrs(Stage::Stage1, attrs).cache_policy(), policy);
            }
        }

        #[test]
        fn protect_preserves_address_and_type() {
            let rw = attrs_from_flags(Stage::Stage1, rw_flags());
            let mut ro_flags = MmuFlags::empty();
            ro_flags.set_readable(true);
            let ro = attrs_from_flags(Stage::Stage1, ro_flags);

            let pte = Pte::page(PhysicalAddress::new(0x3000), rw);
            let reprotected = pte.with_permissions(ro, Stage::Stage1);

            assert_eq!(reprotected.output_address(), pte.output_address());
            assert!(reprotected.is_terminal(PAGE_SIZE_SHIFT));
            assert!(!flags_from_attrs(Stage::Stage1, reprotected.attrs()).is_writable());
        }
    }

    mod stage2 {
        use super::*;

        #[test]
        fn flags_round_trip() {
            for write in [false, true] {
                for execute in [false, true] {
                    let mut flags = MmuFlags::empty();
                    flags.set_readable(true);
                    flags.set_writable(write);
                    flags.set_executable(execute);

                    let attrs = attrs_from_flags(Stage::Stage2, flags);
                    assert_eq!(flags_from_attrs(Stage::Stage2, attrs), flags);
                }
            }
        }
    }

    #[test]
    fn page_table_is_clear() {
        let mut table = Box::new(PageTable::empty());
        assert!(table.is_clear());

        table.set_entry(7, Pte::table(PhysicalAddress::new(0x5000)));
        assert!(!table.is_clear());

        table.set_entry(7, Pte::INVALID);
        assert!(table.is_clear());
    }
}
