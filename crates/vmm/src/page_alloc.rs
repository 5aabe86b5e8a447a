//! Physical page allocation interface.
//!
//! Page-table pages come from the system's physical memory manager, which
//! lives outside this crate. The contract is narrow: single zeroable pages in,
//! single pages out. Freed pages must not be handed back while any stale TLB
//! entry could still translate to them; the consistency manager enforces that
//! by deferring `free_page` until after its flush.

use crate::PhysicalAddress;

/// Error returned when no physical page is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutOfMemory;

/// The external physical page allocator contract.
pub trait PageAllocator: Sync {
    /// Allocates one page. Its contents are unspecified; the caller zeroes it
    /// before publishing it anywhere the hardware can walk.
    fn alloc_page(&self) -> Result<PhysicalAddress, OutOfMemory>;

    /// Returns one page to the allocator. The page must no longer be
    /// referenced by any live or TLB-cached translation.
    fn free_page(&self, page: PhysicalAddress);
}

/// A page allocator over the emulated memory space, for software emulation.
///
/// Supports forced allocation failure after a set number of successes, which
/// tests use to exercise out-of-memory unwind paths.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedPageAllocator {
    state: spin::Mutex<EmulatedAllocState>,
}

#[cfg(any(test, feature = "software-emulation"))]
struct EmulatedAllocState {
    free_list: alloc::vec::Vec<PhysicalAddress>,
    remaining_successes: Option<usize>,
    allocated: usize,
    freed: usize,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedPageAllocator {
    pub fn new() -> Self {
        Self {
            state: spin::Mutex::new(EmulatedAllocState {
                free_list: alloc::vec::Vec::new(),
                remaining_successes: None,
                allocated: 0,
                freed: 0,
            }),
        }
    }

    /// Makes every allocation after the next `successes` fail with
    /// [`OutOfMemory`].
    pub fn fail_after(&self, successes: usize) {
        self.state.lock().remaining_successes = Some(successes);
    }

    /// Total successful allocations so far.
    pub fn alloc_count(&self) -> usize {
        self.state.lock().allocated
    }

    /// Total pages freed so far.
    pub fn free_count(&self) -> usize {
        self.state.lock().freed
    }

    /// Pages currently held by callers.
    pub fn live_pages(&self) -> usize {
        let state = self.state.lock();
        state.allocated - state.freed
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Default for EmulatedPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl PageAllocator for EmulatedPageAllocator {
    fn alloc_page(&self) -> Result<PhysicalAddress, OutOfMemory> {
        let mut state = self.state.lock();

        match &mut state.remaining_successes {
            Some(0) => return Err(OutOfMemory),
            Some(n) => *n -= 1,
            None => {}
        }

        let page = if let Some(page) = state.free_list.pop() {
            page
        } else {
            let phys = crate::AddressTranslator::current()
                .allocate(crate::PAGE_SIZE, crate::PAGE_SIZE)
                .ok_or(OutOfMemory)?;
            PhysicalAddress::new(phys)
        };

        state.allocated += 1;
        Ok(page)
    }

    fn free_page(&self, page: PhysicalAddress) {
        let mut state = self.state.lock();
        assert!(
            !state.free_list.contains(&page),
            "double free of physical page"
        );
        state.freed += 1;
        state.free_list.push(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::AddressTranslator;

    fn setup() {
        AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
    }

    #[test]
    fn alloc_free_recycles() {
        setup();
        let allocator = EmulatedPageAllocator::new();

        let a = allocator.alloc_page().unwrap();
        assert!(a.is_aligned(crate::PAGE_SIZE));
        allocator.free_page(a);
        assert_eq!(allocator.live_pages(), 0);

        let b = allocator.alloc_page().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn forced_failure() {
        setup();
        let allocator = EmulatedPageAllocator::new();
        allocator.fail_after(2);

        assert!(allocator.alloc_page().is_ok());
        assert!(allocator.alloc_page().is_ok());
        assert_eq!(allocator.alloc_page(), Err(OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "double free of physical page")]
    fn double_free_panics() {
        setup();
        let allocator = EmulatedPageAllocator::new();
        let page = allocator.alloc_page().unwrap();
        allocator.free_page(page);
        allocator.free_page(page);
    }
}
