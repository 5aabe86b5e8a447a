//! Architecture capability interface for privileged instructions.
//!
//! Everything the address-space manager needs from the hardware beyond plain
//! memory writes is funneled through the narrow [`ArchOps`] trait: TLB
//! invalidation, memory barriers, translation-register loads, and cache
//! maintenance. The hardware implementation lives in [`arm64`]; tests use the
//! recording fake in [`software`] so no privileged instructions execute.

use crate::{Asid, PhysicalAddress, VirtualAddress};

// Hardware implementation, only available on the target architecture.
#[cfg(target_arch = "aarch64")]
mod arm64;
#[cfg(target_arch = "aarch64")]
pub use arm64::Arm64Ops;

// Software emulation when running tests or when explicitly requested.
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{ArchCall, EmulatedMemory, FakeArchOps};

/// Which TLB entries an invalidation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbScope {
    /// Kernel (global) mappings, visible under every ASID.
    Kernel,
    /// Mappings tagged with one specific ASID.
    Asid(Asid),
    /// Stage-2 mappings of one virtual machine, identified by VMID and the
    /// physical root of its translation table.
    Vmid {
        vmid: u16,
        root: PhysicalAddress,
    },
}

/// Memory barrier strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Barrier {
    /// Orders prior stores before subsequent page-table-walker observation;
    /// used before publishing a newly written table.
    StorePublish,
    /// Full synchronization: prior memory accesses and TLB maintenance
    /// complete before execution continues.
    Synchronize,
}

/// Lower-half translation configuration loaded on a context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslationMode {
    /// User translation enabled through the loaded table.
    User,
    /// Lower-half walks disabled entirely; only kernel mappings resolve.
    KernelOnly,
}

/// Capability interface over privileged instructions, one method per
/// instruction family.
///
/// Implementations must be safe to call concurrently from multiple CPUs; all
/// methods are architecturally broadcast or CPU-local.
pub trait ArchOps: Sync {
    /// Invalidates any cached translation for one page within the scope.
    /// `terminal` selects the last-level variant, which leaves cached
    /// intermediate walk state intact.
    fn invalidate_tlb_entry(&self, scope: TlbScope, vaddr: VirtualAddress, terminal: bool);

    /// Invalidates every cached translation within the scope.
    fn invalidate_tlb_all(&self, scope: TlbScope);

    /// Issues a memory barrier of the given strength.
    fn memory_barrier(&self, barrier: Barrier);

    /// Loads the lower-half translation-table register.
    fn load_translation_table(&self, ttbr: u64);

    /// Reprograms the translation-control register for the given mode.
    fn set_translation_mode(&self, mode: TranslationMode);

    /// Zeroes one page through its CPU-mapped address.
    fn zero_page(&self, page: *mut u8);

    /// Cleans a data-cache range to the point of unification, making prior
    /// writes visible to instruction fetch.
    fn clean_dcache_to_pou(&self, addr: *const u8, len: usize);

    /// Invalidates the entire instruction cache.
    fn invalidate_icache(&self);

    /// Hints the CPU that it is in a spin-wait loop.
    fn yield_cpu(&self);
}
