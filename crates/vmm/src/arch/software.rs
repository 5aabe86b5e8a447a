//! Software emulation of the architecture capability interface.
//!
//! [`FakeArchOps`] records every privileged operation instead of executing it,
//! so unit tests can assert on barrier/invalidation ordering. [`EmulatedMemory`]
//! provides a simulated physical memory space that page-table pages are
//! allocated from and walked through, giving realistic paging behavior on any
//! host.

use alloc::vec::Vec;

use super::{ArchOps, Barrier, TlbScope, TranslationMode};
use crate::VirtualAddress;

/// One recorded call to the architecture interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchCall {
    InvalidateTlbEntry {
        scope: TlbScope,
        vaddr: VirtualAddress,
        terminal: bool,
    },
    InvalidateTlbAll {
        scope: TlbScope,
    },
    MemoryBarrier(Barrier),
    LoadTranslationTable {
        ttbr: u64,
    },
    SetTranslationMode(TranslationMode),
    ZeroPage,
    CleanDcacheToPou {
        len: usize,
    },
    InvalidateIcache,
    YieldCpu,
}

/// A fake [`ArchOps`] implementation that records calls for assertions.
///
/// `zero_page` really zeroes the page (tests walk the resulting tables);
/// everything else only records.
pub struct FakeArchOps {
    calls: spin::Mutex<Vec<ArchCall>>,
}

impl FakeArchOps {
    pub fn new() -> Self {
        Self {
            calls: spin::Mutex::new(Vec::new()),
        }
    }

    /// Returns a copy of every call recorded so far.
    pub fn calls(&self) -> Vec<ArchCall> {
        self.calls.lock().clone()
    }

    /// Removes and returns every call recorded so far.
    pub fn take_calls(&self) -> Vec<ArchCall> {
        core::mem::take(&mut *self.calls.lock())
    }

    fn record(&self, call: ArchCall) {
        self.calls.lock().push(call);
    }
}

impl Default for FakeArchOps {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchOps for FakeArchOps {
    fn invalidate_tlb_entry(&self, scope: TlbScope, vaddr: VirtualAddress, terminal: bool) {
        self.record(ArchCall::InvalidateTlbEntry {
            scope,
            vaddr,
            terminal,
        });
    }

    fn invalidate_tlb_all(&self, scope: TlbScope) {
        self.record(ArchCall::InvalidateTlbAll { scope });
    }

    fn memory_barrier(&self, barrier: Barrier) {
        self.record(ArchCall::MemoryBarrier(barrier));
    }

    fn load_translation_table(&self, ttbr: u64) {
        self.record(ArchCall::LoadTranslationTable { ttbr });
    }

    fn set_translation_mode(&self, mode: TranslationMode) {
        self.record(ArchCall::SetTranslationMode(mode));
    }

    fn zero_page(&self, page: *mut u8) {
        // SAFETY: The caller hands us one writable page.
        unsafe { core::ptr::write_bytes(page, 0, crate::PAGE_SIZE) }
        self.record(ArchCall::ZeroPage);
    }

    fn clean_dcache_to_pou(&self, _addr: *const u8, len: usize) {
        self.record(ArchCall::CleanDcacheToPou { len });
    }

    fn invalidate_icache(&self) {
        self.record(ArchCall::InvalidateIcache);
    }

    fn yield_cpu(&self) {
        self.record(ArchCall::YieldCpu);
    }
}

/// Emulated physical memory for software simulation.
///
/// This provides a simulated physical memory space for testing page table
/// operations without requiring actual hardware or virtual memory support
/// from the host OS.
pub struct EmulatedMemory {
    /// The underlying memory buffer. Over-allocated by one page so a
    /// page-aligned base can be carved out of it regardless of the host
    /// allocator's alignment for `Vec<u8>`.
    memory: Vec<u8>,
    /// Offset within `memory` of the page-aligned logical base address.
    base: usize,
    /// Logical size of the emulated region (excludes the alignment padding).
    size: usize,
    /// Next allocation offset (simple bump allocator).
    next_alloc: core::sync::atomic::AtomicUsize,
}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    pub fn new(size: usize) -> Self {
        // Over-allocate by a page and pick a page-aligned start inside the
        // buffer. Page-table pages require page alignment (`PageTable` is
        // `align(4096)`), so the backing store must hand out page-aligned
        // host pointers for page-aligned physical offsets.
        let memory = alloc::vec![0u8; size + crate::PAGE_SIZE];
        let addr = memory.as_ptr() as usize;
        let base = addr.next_multiple_of(crate::PAGE_SIZE) - addr;
        Self {
            memory,
            base,
            size,
            next_alloc: core::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Returns the page-aligned base pointer of the logical region.
    fn base_ptr(&self) -> *const u8 {
        // SAFETY: `base <= PAGE_SIZE` and the buffer is `size + PAGE_SIZE`
        // bytes, so the offset is within the allocation.
        unsafe { self.memory.as_ptr().add(self.base) }
    }

    /// Allocates a block of memory from the emulated space.
    ///
    /// Returns the physical address of the allocated block, or None if
    /// there's not enough space.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        use core::sync::atomic::Ordering;

        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);

            // Align the current offset
            let aligned = (current + align - 1) & !(align - 1);
            let end = aligned + size;

            if end > self.size {
                return None;
            }

            // Try to claim this allocation
            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Translates a physical address to a virtual address (pointer into the buffer).
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        unsafe { self.base_ptr().add(phys) as *mut u8 }
    }

    /// Translates a virtual address (pointer) back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = unsafe { ptr.offset_from(self.base_ptr()) };
        assert!(offset >= 0, "pointer not within emulated memory");
        assert!(
            (offset as usize) < self.size,
            "pointer not within emulated memory"
        );
        offset as usize
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Asid;

    #[test]
    fn fake_records_calls_in_order() {
        let ops = FakeArchOps::new();
        ops.memory_barrier(Barrier::Synchronize);
        ops.invalidate_tlb_all(TlbScope::Asid(Asid::new(3)));
        ops.memory_barrier(Barrier::Synchronize);

        assert_eq!(
            ops.take_calls(),
            vec![
                ArchCall::MemoryBarrier(Barrier::Synchronize),
                ArchCall::InvalidateTlbAll {
                    scope: TlbScope::Asid(Asid::new(3))
                },
                ArchCall::MemoryBarrier(Barrier::Synchronize),
            ]
        );
        assert!(ops.calls().is_empty());
    }

    #[test]
    fn fake_zero_page_zeroes() {
        let ops = FakeArchOps::new();
        let mut page = vec![0xAAu8; crate::PAGE_SIZE];
        ops.zero_page(page.as_mut_ptr());
        assert!(page.iter().all(|&b| b == 0));
        assert_eq!(ops.take_calls(), vec![ArchCall::ZeroPage]);
    }

    #[test]
    fn emulated_memory_allocates_aligned() {
        let mem = EmulatedMemory::new(64 * 1024);
        let a = mem.allocate(4096, 4096).unwrap();
        let b = mem.allocate(4096, 4096).unwrap();
        assert_eq!(a % 4096, 0);
        assert_eq!(b % 4096, 0);
        assert_ne!(a, b);

        let ptr = mem.translate(a);
        assert_eq!(mem.ptr_to_phys(ptr), a);
    }

    #[test]
    fn emulated_memory_exhausts() {
        let mem = EmulatedMemory::new(8 * 1024);
        assert_eq!(mem.size(), 8 * 1024);
        assert!(mem.allocate(4096, 4096).is_some());
        assert!(mem.allocate(4096, 4096).is_some());
        assert!(mem.allocate(4096, 4096).is_none());
    }
}
