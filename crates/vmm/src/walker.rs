//! Recursive page-table walking.
//!
//! The walker implements the primitives every public address-space operation
//! is built on: descending the radix tree to install, clear, reprotect, and
//! split entries, and the accessed-flag passes used by reclamation. All
//! walker entry points require the caller to hold the owning address space's
//! lock and to supply the call's [`ConsistencyManager`].

use crate::address::AddressTranslator;
use crate::arch::{ArchOps, Barrier};
use crate::aspace::MmuError;
use crate::consistency::ConsistencyManager;
use crate::page_alloc::{OutOfMemory, PageAllocator};
use crate::pte::{self, BLOCK_MAX_SHIFT, PAGE_SIZE_SHIFT, PTES_PER_TABLE, PageTable, Pte, Stage};
use crate::{MmuFlags, PhysicalAddress, VirtualAddress};

/// Geometry and attribute encoding of one translation regime.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Regime {
    /// Lowest virtual address the regime translates.
    pub base: usize,
    /// Log2 of the regime's span.
    pub size_shift: usize,
    /// Index shift of the root table.
    pub top_index_shift: usize,
    /// Log2 of the translation granule.
    pub page_size_shift: usize,
    /// Attribute encoding used by this regime's entries.
    pub stage: Stage,
}

impl Regime {
    /// Lower-half user regime: 48 bits, four levels.
    pub const fn user() -> Self {
        Self {
            base: 0,
            size_shift: 48,
            top_index_shift: 39,
            page_size_shift: PAGE_SIZE_SHIFT,
            stage: Stage::Stage1,
        }
    }

    /// Upper-half kernel regime: 48 bits, four levels.
    pub const fn kernel() -> Self {
        Self {
            base: !0usize << 48,
            size_shift: 48,
            top_index_shift: 39,
            page_size_shift: PAGE_SIZE_SHIFT,
            stage: Stage::Stage1,
        }
    }

    /// Guest intermediate-physical regime: 39 bits, three levels, so the root
    /// stays a single page.
    pub const fn guest() -> Self {
        Self {
            base: 0,
            size_shift: 39,
            top_index_shift: 30,
            page_size_shift: PAGE_SIZE_SHIFT,
            stage: Stage::Stage2,
        }
    }

    /// Span of the regime in bytes.
    pub const fn span(&self) -> usize {
        1 << self.size_shift
    }

    /// Index-shift delta between adjacent levels.
    pub const fn index_step(&self) -> usize {
        self.page_size_shift - 3
    }

    /// Returns whether `[vaddr, vaddr + size)` lies within the regime.
    /// A zero-size range is in range if its base is.
    pub fn contains(&self, vaddr: usize, size: usize) -> bool {
        let rel = vaddr.wrapping_sub(self.base);
        rel < self.span() && size <= self.span() - rel
    }
}

/// Returns a mutable reference to the page table stored in the given page.
///
/// The returned lifetime is unconstrained; callers must only use it while
/// holding the owning address space's lock, which serializes all access.
pub(crate) fn table_mut<'t>(paddr: PhysicalAddress) -> &'t mut PageTable {
    let ptr = AddressTranslator::current().phys_to_ptr::<PageTable>(paddr.as_usize());
    // SAFETY: Page-table pages are page-sized, page-aligned, and owned by
    // exactly one parent entry, so the tree structure guarantees no aliasing
    // references are created while walking it.
    unsafe { &mut *ptr }
}

fn va(addr: usize) -> VirtualAddress {
    VirtualAddress::new(addr)
}

/// Walks and mutates the page-table tree of one address space.
///
/// Borrows the address space's live page-table-page counter so every table
/// allocation and free is accounted for; the counter is validated when the
/// address space is destroyed.
pub(crate) struct Walker<'a> {
    regime: Regime,
    arch: &'a dyn ArchOps,
    allocator: &'a dyn PageAllocator,
    pt_pages: &'a mut usize,
}

impl<'a> Walker<'a> {
    pub fn new(
        regime: Regime,
        arch: &'a dyn ArchOps,
        allocator: &'a dyn PageAllocator,
        pt_pages: &'a mut usize,
    ) -> Self {
        Self {
            regime,
            arch,
            allocator,
            pt_pages,
        }
    }

    fn alloc_page_table(&mut self) -> Result<PhysicalAddress, OutOfMemory> {
        let page = self.allocator.alloc_page()?;
        *self.pt_pages += 1;
        log::trace!("allocated page table at {}", page);
        Ok(page)
    }

    /// Removes a page-table page from the accounting and queues it for
    /// release after the pending invalidations complete.
    fn free_page_table(&mut self, paddr: PhysicalAddress, cm: &mut ConsistencyManager<'_>) {
        assert!(*self.pt_pages > 0, "page-table page accounting underflow");
        *self.pt_pages -= 1;
        log::trace!("freeing page table at {}", paddr);
        cm.free_page(paddr);
    }

    /// Maps `[vaddr, vaddr + size)` to the physically contiguous range at
    /// `paddr`, recursing from the level addressed by `index_shift`.
    ///
    /// On failure the already-installed portion of this call is unwound
    /// before the error is returned, and any table allocated solely for the
    /// failed chunk is torn down immediately.
    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &mut self,
        vaddr: usize,
        vaddr_rel: usize,
        paddr: usize,
        size: usize,
        attrs: u64,
        index_shift: usize,
        table: &mut PageTable,
        cm: &mut ConsistencyManager<'_>,
    ) -> Result<usize, MmuError> {
        let block_size = 1usize << index_shift;
        let block_mask = block_size - 1;

        log::trace!(
            "map vaddr {:#x} vaddr_rel {:#x} paddr {:#x} size {:#x} attrs {:#x} index_shift {}",
            vaddr,
            vaddr_rel,
            paddr,
            size,
            attrs,
            index_shift
        );

        if (vaddr_rel | paddr | size) & ((1 << self.regime.page_size_shift) - 1) != 0 {
            log::warn!("map arguments not page aligned");
            return Err(MmuError::InvalidArgument);
        }

        let (unwind_vaddr, unwind_vaddr_rel) = (vaddr, vaddr_rel);
        let mut vaddr = vaddr;
        let mut vaddr_rel = vaddr_rel;
        let mut paddr = paddr;
        let mut size = size;
        let mut mapped_size = 0usize;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
            let index = vaddr_rel >> index_shift;
            let pte = table.entry(index);

            // At an unaligned address, a chunk smaller than this level's
            // block, or a level too coarse to hold blocks, recurse one level
            // deeper.
            if ((vaddr_rel | paddr) & block_mask) != 0
                || chunk_size != block_size
                || index_shift > BLOCK_MAX_SHIFT
            {
                let (next_table_paddr, allocated) = if !pte.is_valid() {
                    let page = match self.alloc_page_table() {
                        Ok(page) => page,
                        Err(OutOfMemory) => {
                            log::error!("failed to allocate page table");
                            self.unmap(unwind_vaddr, unwind_vaddr_rel, mapped_size, index_shift, table, cm);
                            return Err(MmuError::OutOfMemory);
                        }
                    };
                    let page_ptr = AddressTranslator::current().phys_to_ptr::<u8>(page.as_usize());
                    self.arch.zero_page(page_ptr);
                    // The zeroing must be visible to hardware walkers before
                    // the entry publishes the table; this cannot be deferred
                    // to the consistency manager.
                    self.arch.memory_barrier(Barrier::StorePublish);

                    // Terminal mappings are installed with their accessed flag
                    // already set, so a fresh non-terminal entry starts
                    // accessed as well.
                    table.set_entry(index, Pte::table(page).set_table_accessed());
                    (page, true)
                } else if pte.is_table(index_shift) {
                    // A mapping about to be installed below this table starts
                    // off accessed; set the accessed flag on the way down.
                    table.set_entry(index, pte.set_table_accessed());
                    (pte.output_address(), false)
                } else {
                    // An existing block mapping: never implicitly overwritten.
                    log::trace!("entry {:#x} already holds a block: {:?}", index, pte);
                    self.unmap(unwind_vaddr, unwind_vaddr_rel, mapped_size, index_shift, table, cm);
                    return Err(MmuError::AlreadyMapped);
                };

                let next_table = table_mut(next_table_paddr);
                let next_shift = index_shift - self.regime.index_step();
                if let Err(err) =
                    self.map(vaddr, vaddr_rem, paddr, chunk_size, attrs, next_shift, next_table, cm)
                {
                    if allocated {
                        // This table was allocated for the chunk that just
                        // failed, and the failed call unwound its own partial
                        // work, so the table must be empty. Tear it down now;
                        // the unwind below stops short of this chunk and would
                        // never look inside it.
                        debug_assert!(next_table.is_clear());
                        table.set_entry(index, Pte::INVALID);
                        // Deferring the invalidation is safe: the consistency
                        // manager holds the page until the flush completes.
                        cm.flush_entry(va(vaddr), false);
                        self.free_page_table(next_table_paddr, cm);
                    }
                    self.unmap(unwind_vaddr, unwind_vaddr_rel, mapped_size, index_shift, table, cm);
                    return Err(err);
                }
            } else {
                if pte.is_valid() {
                    log::trace!("entry {:#x} already in use: {:?}", index, pte);
                    self.unmap(unwind_vaddr, unwind_vaddr_rel, mapped_size, index_shift, table, cm);
                    return Err(MmuError::AlreadyMapped);
                }

                let target = PhysicalAddress::new(paddr);
                let new_pte = if index_shift > self.regime.page_size_shift {
                    Pte::block(target, attrs)
                } else {
                    Pte::page(target, attrs)
                };
                table.set_entry(index, new_pte);
            }

            vaddr += chunk_size;
            vaddr_rel += chunk_size;
            paddr += chunk_size;
            size -= chunk_size;
            mapped_size += chunk_size;
        }

        Ok(mapped_size)
    }

    /// Clears every terminal entry in `[vaddr, vaddr + size)`, freeing child
    /// tables that become empty or whose whole span was covered. Returns the
    /// number of bytes that were actually mapped and are now unmapped.
    pub fn unmap(
        &mut self,
        vaddr: usize,
        vaddr_rel: usize,
        size: usize,
        index_shift: usize,
        table: &mut PageTable,
        cm: &mut ConsistencyManager<'_>,
    ) -> usize {
        let block_size = 1usize << index_shift;
        let block_mask = block_size - 1;

        log::trace!(
            "unmap vaddr {:#x} vaddr_rel {:#x} size {:#x} index_shift {}",
            vaddr,
            vaddr_rel,
            size,
            index_shift
        );
        debug_assert_eq!((vaddr_rel | size) & ((1 << self.regime.page_size_shift) - 1), 0);

        let mut vaddr = vaddr;
        let mut vaddr_rel = vaddr_rel;
        let mut size = size;
        let mut released = 0usize;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
            let index = vaddr_rel >> index_shift;
            let pte = table.entry(index);

            if pte.is_table(index_shift) {
                let next_table_paddr = pte.output_address();
                let next_table = table_mut(next_table_paddr);
                let next_shift = index_shift - self.regime.index_step();

                released += self.unmap(vaddr, vaddr_rem, chunk_size, next_shift, next_table, cm);

                // Free the child table if the unmap covered its whole span or
                // left it empty.
                if chunk_size == block_size || next_table.is_clear() {
                    table.set_entry(index, Pte::INVALID);
                    // Deferring the invalidation is safe: the consistency
                    // manager holds the page until the flush completes.
                    cm.flush_entry(va(vaddr), false);
                    self.free_page_table(next_table_paddr, cm);
                }
            } else if pte.is_valid() {
                table.set_entry(index, Pte::INVALID);
                cm.flush_entry(va(vaddr), true);
                released += chunk_size;
            } else {
                log::trace!("entry {:#x} already clear", index);
            }

            vaddr += chunk_size;
            vaddr_rel += chunk_size;
            size -= chunk_size;
        }

        released
    }

    /// Rewrites the permission attributes of every valid terminal entry in
    /// `[vaddr, vaddr + size)`, splitting blocks that are only partially
    /// covered. A failed split degrades to unmapping the whole block; the
    /// translation fault that follows re-establishes mappings lazily.
    #[allow(clippy::too_many_arguments)]
    pub fn protect(
        &mut self,
        vaddr: usize,
        vaddr_rel: usize,
        size: usize,
        attrs: u64,
        index_shift: usize,
        table: &mut PageTable,
        cm: &mut ConsistencyManager<'_>,
    ) {
        let block_size = 1usize << index_shift;
        let block_mask = block_size - 1;

        log::trace!(
            "protect vaddr {:#x} vaddr_rel {:#x} size {:#x} attrs {:#x} index_shift {}",
            vaddr,
            vaddr_rel,
            size,
            attrs,
            index_shift
        );
        debug_assert_eq!((vaddr_rel | size) & ((1 << self.regime.page_size_shift) - 1), 0);

        let mut vaddr = vaddr;
        let mut vaddr_rel = vaddr_rel;
        let mut size = size;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
            let index = vaddr_rel >> index_shift;
            let mut pte = table.entry(index);

            if pte.is_block(index_shift) && chunk_size != block_size {
                // Only part of this block changes permissions, so it must be
                // split into a finer-grained subtree first.
                match self.split_large_page(vaddr, index_shift, index, table, cm) {
                    Ok(()) => pte = table.entry(index),
                    Err(OutOfMemory) => {
                        // Out of pages for the split: unmap the whole block
                        // instead and let a subsequent translation fault
                        // re-establish the mappings.
                        self.unmap(
                            vaddr - vaddr_rem,
                            vaddr_rel - vaddr_rem,
                            block_size,
                            index_shift,
                            table,
                            cm,
                        );
                        pte = Pte::INVALID;
                    }
                }
            }

            if pte.is_table(index_shift) {
                let next_table = table_mut(pte.output_address());
                let next_shift = index_shift - self.regime.index_step();
                self.protect(vaddr, vaddr_rem, chunk_size, attrs, next_shift, next_table, cm);
            } else if pte.is_valid() {
                table.set_entry(index, pte.with_permissions(attrs, self.regime.stage));
                cm.flush_entry(va(vaddr), true);
            } else {
                log::trace!("entry {:#x} does not exist", index);
            }

            vaddr += chunk_size;
            vaddr_rel += chunk_size;
            size -= chunk_size;
        }
    }

    /// Replaces the block entry at `table[pt_index]` with a table entry whose
    /// children describe the same physical range at the next finer
    /// granularity.
    pub fn split_large_page(
        &mut self,
        vaddr: usize,
        index_shift: usize,
        pt_index: usize,
        table: &mut PageTable,
        cm: &mut ConsistencyManager<'_>,
    ) -> Result<(), OutOfMemory> {
        debug_assert!(index_shift > self.regime.page_size_shift);

        let pte = table.entry(pt_index);
        debug_assert!(pte.is_block(index_shift));

        let page = match self.alloc_page_table() {
            Ok(page) => page,
            Err(OutOfMemory) => {
                log::error!("failed to allocate page table for split");
                return Err(OutOfMemory);
            }
        };

        let next_shift = index_shift - self.regime.index_step();
        let next_size = 1usize << next_shift;
        let attrs = pte.attrs();
        let base = pte.output_address().as_usize();

        let new_table = table_mut(page);
        for i in 0..PTES_PER_TABLE {
            let child_base = PhysicalAddress::new(base + i * next_size);
            let child = if next_shift == self.regime.page_size_shift {
                Pte::page(child_base, attrs)
            } else {
                Pte::block(child_base, attrs)
            };
            // The table is not reachable yet, so these writes race with
            // nothing.
            new_table.set_entry(i, child);
        }

        // The populated table must be visible before the entry publishes it.
        self.arch.memory_barrier(Barrier::StorePublish);
        table.set_entry(pt_index, Pte::table(page));
        cm.flush_entry(va(vaddr), false);

        Ok(())
    }

    /// Visits the accessed flag of terminal entries in `[vaddr, vaddr + size)`
    /// and clears it where `callback` asks for it. Subtrees whose software
    /// accessed flag is clear are skipped entirely.
    ///
    /// Each examined entry consumes one unit of `entry_limit`; the walk stops
    /// early once the limit is exhausted. The limit is decremented only after
    /// an entry has been processed, so even a limit of one makes forward
    /// progress. Returns the number of bytes the walk advanced over.
    #[allow(clippy::too_many_arguments)]
    pub fn harvest_accessed(
        &mut self,
        entry_limit: &mut usize,
        vaddr: usize,
        vaddr_rel: usize,
        size: usize,
        index_shift: usize,
        table: &mut PageTable,
        callback: &mut dyn FnMut(PhysicalAddress, VirtualAddress, MmuFlags) -> bool,
        cm: &mut ConsistencyManager<'_>,
    ) -> usize {
        let block_size = 1usize << index_shift;
        let block_mask = block_size - 1;

        debug_assert_eq!((vaddr_rel | size) & ((1 << self.regime.page_size_shift) - 1), 0);

        let mut vaddr = vaddr;
        let mut vaddr_rel = vaddr_rel;
        let mut size = size;
        let mut harvested_size = 0usize;

        while size > 0 && *entry_limit > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let index = vaddr_rel >> index_shift;
            let mut chunk_size = core::cmp::min(size, block_size - vaddr_rem);
            let pte = table.entry(index);

            if pte.is_block(index_shift) && chunk_size != block_size {
                // Partially covered blocks are not harvested; accessed state
                // is never reclaimed at block granularity.
            } else if pte.is_table(index_shift) {
                // The software accessed flag tells us whether anything below
                // was touched since the last harvest; skip cold subtrees.
                if pte.is_table_accessed() {
                    let next_table = table_mut(pte.output_address());
                    let next_shift = index_shift - self.regime.index_step();
                    chunk_size = self.harvest_accessed(
                        entry_limit,
                        vaddr,
                        vaddr_rem,
                        chunk_size,
                        next_shift,
                        next_table,
                        callback,
                        cm,
                    );
                }
            } else if pte.is_valid() && pte.is_accessed() {
                let paddr = PhysicalAddress::new(pte.output_address().as_usize() + vaddr_rem);
                let flags = pte::flags_from_attrs(self.regime.stage, pte.attrs());

                if callback(paddr, va(vaddr), flags) {
                    // Clearing the accessed flag does not require
                    // break-before-make, and hardware flag updates are not
                    // enabled, so there is no concurrent setter to race with.
                    table.set_entry(index, pte.clear_accessed());
                    cm.flush_entry(va(vaddr), true);
                }
            }

            vaddr += chunk_size;
            vaddr_rel += chunk_size;
            size -= chunk_size;
            harvested_size += chunk_size;

            // Decrement after the entry is processed so that harvesting makes
            // progress even when the initial limit is too small to reach a
            // terminal entry.
            if *entry_limit > 0 {
                *entry_limit -= 1;
            }
        }

        harvested_size
    }

    /// Sets the hardware accessed flag on covered terminal entries and the
    /// software accessed flag on every non-terminal entry walked through.
    /// Setting flags needs no TLB maintenance; nothing relies on observing a
    /// stale clear flag promptly.
    pub fn mark_accessed(
        &mut self,
        vaddr: usize,
        vaddr_rel: usize,
        size: usize,
        index_shift: usize,
        table: &mut PageTable,
    ) {
        let block_size = 1usize << index_shift;
        let block_mask = block_size - 1;

        debug_assert_eq!((vaddr_rel | size) & ((1 << self.regime.page_size_shift) - 1), 0);

        let mut vaddr = vaddr;
        let mut vaddr_rel = vaddr_rel;
        let mut size = size;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
            let index = vaddr_rel >> index_shift;
            let pte = table.entry(index);

            if pte.is_block(index_shift) && chunk_size != block_size {
                // Partially covered blocks keep their flags unchanged.
            } else if pte.is_table(index_shift) {
                table.set_entry(index, pte.set_table_accessed());
                let next_table = table_mut(pte.output_address());
                let next_shift = index_shift - self.regime.index_step();
                self.mark_accessed(vaddr, vaddr_rem, chunk_size, next_shift, next_table);
            } else if pte.is_valid() && !pte.is_accessed() {
                table.set_entry(index, pte.set_accessed());
            }

            vaddr += chunk_size;
            vaddr_rel += chunk_size;
            size -= chunk_size;
        }
    }

    /// Determines bottom-up whether `[vaddr, vaddr + size)` has been accessed
    /// since the last pass, unmapping and freeing subtrees that have not.
    /// Surviving non-terminal entries have their software accessed flag
    /// cleared so the next pass starts cold.
    pub fn free_unaccessed(
        &mut self,
        vaddr: usize,
        vaddr_rel: usize,
        size: usize,
        index_shift: usize,
        table: &mut PageTable,
        cm: &mut ConsistencyManager<'_>,
    ) -> bool {
        log::trace!(
            "free_unaccessed vaddr {:#x} vaddr_rel {:#x} size {:#x} index_shift {}",
            vaddr,
            vaddr_rel,
            size,
            index_shift
        );

        if index_shift <= self.regime.page_size_shift {
            // Terminal tables are assumed accessed rather than scanned;
            // individual terminal entries are reclaimed through
            // harvest_accessed instead. The only exception would be a race
            // where the accessed pages were just manually unmapped.
            return true;
        }

        let block_size = 1usize << index_shift;
        let block_mask = block_size - 1;

        let mut vaddr = vaddr;
        let mut vaddr_rel = vaddr_rel;
        let mut size = size;
        let mut have_accessed = false;

        while size > 0 {
            let vaddr_rem = vaddr_rel & block_mask;
            let chunk_size = core::cmp::min(size, block_size - vaddr_rem);
            let index = vaddr_rel >> index_shift;
            let pte = table.entry(index);

            if pte.is_table(index_shift) {
                let next_table_paddr = pte.output_address();
                let next_table = table_mut(next_table_paddr);
                let next_shift = index_shift - self.regime.index_step();

                let mut accessed = false;
                if pte.is_table_accessed() {
                    // The subtree was accessed in the past, but parts of it
                    // may still be reclaimable, and reclaiming them can leave
                    // this table empty.
                    accessed =
                        self.free_unaccessed(vaddr, vaddr_rem, chunk_size, next_shift, next_table, cm);
                }
                if !accessed {
                    self.unmap(vaddr, vaddr_rem, chunk_size, next_shift, next_table, cm);
                    debug_assert!(next_table.is_clear());
                    table.set_entry(index, Pte::INVALID);
                    // Deferring the invalidation is safe: the consistency
                    // manager holds the page until the flush completes.
                    cm.flush_entry(va(vaddr), false);
                    self.free_page_table(next_table_paddr, cm);
                } else {
                    // The entry survives; clear its flag so the next pass
                    // starts cold.
                    table.set_entry(index, pte.clear_table_accessed());
                    have_accessed = true;
                }
            } else if pte.is_valid() {
                // A block mapping. Accessed state is never harvested at block
                // granularity, so it is conservatively treated as accessed.
                have_accessed = true;
            }

            vaddr += chunk_size;
            vaddr_rel += chunk_size;
            size -= chunk_size;
        }

        have_accessed
    }
}
