//! Batched TLB maintenance for one critical section.
//!
//! Every mutating walk constructs a [`ConsistencyManager`] on the stack while
//! holding the address-space lock, queues per-entry invalidations into it, and
//! lets its destructor perform the flush. Batching lets one pair of barriers
//! cover many invalidations, and switching to a whole-address-space
//! invalidation caps the cost of large operations.
//!
//! Pages that previously served as page tables are queued here rather than
//! freed synchronously: they are handed back to the allocator only after the
//! flush, so a stale cached walk can never translate through a page that has
//! already been reused.

use alloc::vec::Vec;

use crate::arch::{ArchOps, Barrier, TlbScope};
use crate::page_alloc::PageAllocator;
use crate::{counters, PhysicalAddress, VirtualAddress};

/// Maximum number of TLB entries queued before the flush is collapsed into a
/// whole-address-space invalidation.
const MAX_PENDING_TLBS: usize = 16;

/// Tracks pending TLB invalidations and deferred page frees for one mutating
/// call. Constructing it does nothing observable; dropping it always flushes.
pub(crate) struct ConsistencyManager<'a> {
    arch: &'a dyn ArchOps,
    allocator: &'a dyn PageAllocator,
    scope: TlbScope,
    /// Pending invalidations. Addresses are page aligned, so the bottom bit
    /// stores the terminal flag.
    pending: [u64; MAX_PENDING_TLBS],
    /// Count of requested invalidations; keeps rising past the array capacity
    /// to record how many entries a collapsed flush replaced.
    num_pending: usize,
    /// Former page-table pages to release after the flush.
    to_free: Vec<PhysicalAddress>,
}

impl<'a> ConsistencyManager<'a> {
    pub fn new(
        arch: &'a dyn ArchOps,
        allocator: &'a dyn PageAllocator,
        scope: TlbScope,
    ) -> Self {
        Self {
            arch,
            allocator,
            scope,
            pending: [0; MAX_PENDING_TLBS],
            num_pending: 0,
            to_free: Vec::new(),
        }
    }

    /// Queues one TLB entry for invalidation. This may get turned into a
    /// whole-address-space invalidation.
    pub fn flush_entry(&mut self, vaddr: VirtualAddress, terminal: bool) {
        debug_assert!(vaddr.is_aligned(crate::PAGE_SIZE));

        if self.num_pending >= MAX_PENDING_TLBS {
            if !matches!(self.scope, TlbScope::Kernel) {
                // Committed to a full invalidation; keep counting entries so
                // the counters can report how many invalidations were saved.
                self.num_pending += 1;
                return;
            }
            // Kernel mappings have no single-scope invalidation instruction to
            // fall back on, so drain what is queued and start over.
            self.flush();
        }

        self.pending[self.num_pending] = vaddr.as_usize() as u64 | terminal as u64;
        self.num_pending += 1;
    }

    /// Performs any pending invalidations, bracketed by barriers: the first
    /// makes prior page-table writes visible to the translation hardware, the
    /// second makes the invalidations visible before the caller releases the
    /// address-space lock.
    pub fn flush(&mut self) {
        counters::CM_FLUSH.inc();
        if self.num_pending == 0 {
            return;
        }

        self.arch.memory_barrier(Barrier::Synchronize);

        if self.num_pending >= MAX_PENDING_TLBS && !matches!(self.scope, TlbScope::Kernel) {
            counters::CM_FLUSH_ALL.inc();
            counters::CM_FLUSH_ALL_REPLACING.add(self.num_pending as u64);
            self.arch.invalidate_tlb_all(self.scope);
        } else {
            for record in &self.pending[..self.num_pending] {
                let vaddr = VirtualAddress::new((record & !1) as usize);
                let terminal = (record & 1) != 0;
                self.arch.invalidate_tlb_entry(self.scope, vaddr, terminal);
            }
            counters::CM_SINGLE_TLB_INVALIDATES.add(self.num_pending as u64);
        }

        self.arch.memory_barrier(Barrier::Synchronize);
        self.num_pending = 0;
    }

    /// Queues a former page-table page for release once invalidation has
    /// completed.
    pub fn free_page(&mut self, page: PhysicalAddress) {
        self.to_free.push(page);
    }
}

impl Drop for ConsistencyManager<'_> {
    fn drop(&mut self) {
        self.flush();
        for page in self.to_free.drain(..) {
            self.allocator.free_page(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchCall, FakeArchOps};
    use crate::page_alloc::EmulatedPageAllocator;
    use crate::{AddressTranslator, Asid};

    fn setup() -> (FakeArchOps, EmulatedPageAllocator) {
        AddressTranslator::set_current(AddressTranslator::emulated(256 * 1024));
        (FakeArchOps::new(), EmulatedPageAllocator::new())
    }

    fn page(n: usize) -> VirtualAddress {
        VirtualAddress::new(n * crate::PAGE_SIZE)
    }

    #[test]
    fn drop_without_entries_is_silent() {
        let (arch, allocator) = setup();
        {
            let _cm = ConsistencyManager::new(&arch, &allocator, TlbScope::Asid(Asid::new(5)));
        }
        assert!(arch.take_calls().is_empty());
    }

    #[test]
    fn small_batches_invalidate_individually() {
        let (arch, allocator) = setup();
        let scope = TlbScope::Asid(Asid::new(5));
        {
            let mut cm = ConsistencyManager::new(&arch, &allocator, scope);
            cm.flush_entry(page(1), true);
            cm.flush_entry(page(2), false);
        }

        assert_eq!(
            arch.take_calls(),
            vec![
                ArchCall::MemoryBarrier(Barrier::Synchronize),
                ArchCall::InvalidateTlbEntry {
                    scope,
                    vaddr: page(1),
                    terminal: true,
                },
                ArchCall::InvalidateTlbEntry {
                    scope,
                    vaddr: page(2),
                    terminal: false,
                },
                ArchCall::MemoryBarrier(Barrier::Synchronize),
            ]
        );
    }

    #[test]
    fn hitting_the_cap_collapses_to_full_invalidation() {
        let (arch, allocator) = setup();
        let scope = TlbScope::Asid(Asid::new(7));
        {
            let mut cm = ConsistencyManager::new(&arch, &allocator, scope);
            for i in 0..40 {
                cm.flush_entry(page(i), true);
            }
        }

        assert_eq!(
            arch.take_calls(),
            vec![
                ArchCall::MemoryBarrier(Barrier::Synchronize),
                ArchCall::InvalidateTlbAll { scope },
                ArchCall::MemoryBarrier(Barrier::Synchronize),
            ]
        );
    }

    #[test]
    fn exactly_at_the_cap_collapses() {
        let (arch, allocator) = setup();
        let scope = TlbScope::Asid(Asid::new(9));
        {
            let mut cm = ConsistencyManager::new(&arch, &allocator, scope);
            for i in 0..16 {
                cm.flush_entry(page(i), true);
            }
        }

        let calls = arch.take_calls();
        assert!(calls.contains(&ArchCall::InvalidateTlbAll { scope }));
    }

    #[test]
    fn kernel_scope_flushes_immediately_at_cap() {
        let (arch, allocator) = setup();
        {
            let mut cm = ConsistencyManager::new(&arch, &allocator, TlbScope::Kernel);
            for i in 0..17 {
                cm.flush_entry(page(i), true);
            }
        }

        let calls = arch.take_calls();
        let singles = calls
            .iter()
            .filter(|c| matches!(c, ArchCall::InvalidateTlbEntry { .. }))
            .count();
        let fulls = calls
            .iter()
            .filter(|c| matches!(c, ArchCall::InvalidateTlbAll { .. }))
            .count();
        // Two flushes: one forced at the cap with 16 entries, one at drop with
        // the remaining entry. Kernel scope never collapses.
        assert_eq!(singles, 17);
        assert_eq!(fulls, 0);
        assert_eq!(
            calls
                .iter()
                .filter(|c| matches!(c, ArchCall::MemoryBarrier(Barrier::Synchronize)))
                .count(),
            4
        );
    }

    #[test]
    fn guest_scope_uses_hypervisor_stage_invalidation() {
        let (arch, allocator) = setup();
        let scope = TlbScope::Vmid {
            vmid: 3,
            root: PhysicalAddress::new(0x8000),
        };
        {
            let mut cm = ConsistencyManager::new(&arch, &allocator, scope);
            cm.flush_entry(page(4), true);
        }

        assert!(arch.take_calls().contains(&ArchCall::InvalidateTlbEntry {
            scope,
            vaddr: page(4),
            terminal: true,
        }));
    }

    #[test]
    fn queued_pages_release_only_at_drop() {
        let (arch, allocator) = setup();
        let table_page = allocator.alloc_page().unwrap();
        {
            let mut cm = ConsistencyManager::new(&arch, &allocator, TlbScope::Asid(Asid::new(2)));
            cm.flush_entry(page(1), false);
            cm.free_page(table_page);
            // The page is still held while stale translations may reference it.
            assert_eq!(allocator.free_count(), 0);
        }
        assert_eq!(allocator.free_count(), 1);
        assert!(!arch.take_calls().is_empty());
    }
}
