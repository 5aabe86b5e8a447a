//! Address-space identifiers and the allocator interface.
//!
//! TLB entries are tagged with a 16-bit ASID so that context switches do not
//! require a full invalidation. The allocator itself lives outside this crate;
//! this module defines the contract and the explicitly-initialized global slot
//! through which user address spaces obtain identifiers.

/// A 16-bit address-space identifier (or VMID, for guest address spaces).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Asid(u16);

impl Asid {
    /// Sentinel for an address space that holds no identifier (not yet
    /// initialized, or already torn down).
    pub const UNUSED: Asid = Asid(0);

    /// The reserved identifier for the kernel address space. Kernel mappings
    /// are global: no single-ASID invalidation instruction covers them.
    pub const KERNEL: Asid = Asid(1);

    /// The first identifier available to the external allocator.
    pub const FIRST_AVAILABLE: Asid = Asid(2);

    /// Creates an identifier from a raw value.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Returns the raw identifier value.
    pub const fn value(self) -> u16 {
        self.0
    }
}

/// Error returned when the allocator has no free identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsidsExhausted;

/// The external ASID allocator contract.
///
/// One identifier is held per user address space for its whole active
/// lifetime. Exhaustion is surfaced to the caller as a fatal initialization
/// error; there is no retry.
pub trait AsidAllocator: Sync {
    /// Allocates a free identifier.
    fn alloc(&self) -> Result<Asid, AsidsExhausted>;

    /// Returns an identifier to the pool.
    fn free(&self, asid: Asid);
}

/// Sets the global ASID allocator.
///
/// Must be called exactly once during initialization, before any user address
/// space is created.
///
/// # Panics
///
/// Panics if the allocator has already been set.
pub fn set_allocator(allocator: &'static dyn AsidAllocator) {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        if ASID_ALLOCATOR.get().is_some() {
            panic!("ASID allocator already set");
        }
        ASID_ALLOCATOR.call_once(|| allocator);
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        ASID_ALLOCATOR.with(|slot| {
            if slot.get().is_some() {
                panic!("ASID allocator already set");
            }
            slot.call_once(|| allocator);
        });
    }
}

/// Returns the global ASID allocator.
///
/// # Panics
///
/// Panics if the allocator has not been set yet.
pub fn allocator() -> &'static dyn AsidAllocator {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        *ASID_ALLOCATOR
            .get()
            .expect("ASID allocator not set; call asid::set_allocator during initialization")
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        ASID_ALLOCATOR.with(|slot| {
            *slot
                .get()
                .expect("ASID allocator not set; call asid::set_allocator during initialization")
        })
    }
}

/// Returns the global ASID allocator if it has been set.
#[cfg(any(test, feature = "software-emulation"))]
pub fn try_allocator() -> Option<&'static dyn AsidAllocator> {
    ASID_ALLOCATOR.with(|slot| slot.get().copied())
}

/// Global ASID allocator slot.
///
/// In test/software-emulation mode this is thread-local so every test thread
/// can install its own allocator.
#[cfg(not(any(test, feature = "software-emulation")))]
static ASID_ALLOCATOR: spin::Once<&'static dyn AsidAllocator> = spin::Once::new();

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ASID_ALLOCATOR: spin::Once<&'static dyn AsidAllocator> = spin::Once::new();
}

/// A simple allocator over a bounded identifier range, for software emulation.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedAsidAllocator {
    state: spin::Mutex<EmulatedAsidState>,
}

#[cfg(any(test, feature = "software-emulation"))]
struct EmulatedAsidState {
    next: u16,
    limit: u16,
    free_list: alloc::vec::Vec<Asid>,
    outstanding: usize,
}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedAsidAllocator {
    /// Creates an allocator with a generous default capacity.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Creates an allocator that hands out at most `capacity` identifiers.
    pub fn with_capacity(capacity: u16) -> Self {
        Self {
            state: spin::Mutex::new(EmulatedAsidState {
                next: Asid::FIRST_AVAILABLE.value(),
                limit: Asid::FIRST_AVAILABLE.value() + capacity,
                free_list: alloc::vec::Vec::new(),
                outstanding: 0,
            }),
        }
    }

    /// Returns the number of identifiers currently held by address spaces.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Default for EmulatedAsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl AsidAllocator for EmulatedAsidAllocator {
    fn alloc(&self) -> Result<Asid, AsidsExhausted> {
        let mut state = self.state.lock();
        let asid = if let Some(asid) = state.free_list.pop() {
            asid
        } else if state.next < state.limit {
            let asid = Asid::new(state.next);
            state.next += 1;
            asid
        } else {
            return Err(AsidsExhausted);
        };
        state.outstanding += 1;
        Ok(asid)
    }

    fn free(&self, asid: Asid) {
        assert!(
            asid != Asid::UNUSED && asid != Asid::KERNEL,
            "freeing a reserved ASID"
        );
        let mut state = self.state.lock();
        state.outstanding -= 1;
        state.free_list.push(asid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ids() {
        let allocator = EmulatedAsidAllocator::new();
        let a = allocator.alloc().unwrap();
        let b = allocator.alloc().unwrap();
        assert_ne!(a, b);
        assert_ne!(a, Asid::UNUSED);
        assert_ne!(a, Asid::KERNEL);
        assert_eq!(allocator.outstanding(), 2);
    }

    #[test]
    fn recycles_freed_ids() {
        let allocator = EmulatedAsidAllocator::with_capacity(1);
        let a = allocator.alloc().unwrap();
        assert_eq!(allocator.alloc(), Err(AsidsExhausted));

        allocator.free(a);
        assert_eq!(allocator.outstanding(), 0);
        assert_eq!(allocator.alloc(), Ok(a));
    }

    #[test]
    #[should_panic(expected = "freeing a reserved ASID")]
    fn freeing_kernel_asid_panics() {
        let allocator = EmulatedAsidAllocator::new();
        allocator.free(Asid::KERNEL);
    }
}
