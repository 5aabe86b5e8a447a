//! ARM64 hardware implementation of the architecture capability interface.
//!
//! TLB maintenance and cache maintenance use inline `tlbi`/`dc`/`ic`
//! instructions; barriers and system-register access go through the
//! `aarch64-cpu` crate. All TLB and icache operations use the inner-shareable
//! broadcast variants so every CPU in the system observes them.

use core::arch::asm;

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::{TCR_EL1, TTBR0_EL1, VTTBR_EL2, Writeable};

use super::{ArchOps, Barrier, TlbScope, TranslationMode};
use crate::VirtualAddress;

/// Translation-control value with the lower-half (user) walk enabled.
///
/// 48-bit regions for both halves, 4 KiB granule, inner-shareable write-back
/// walks, ASID from TTBR0.
const TCR_FLAGS_USER: u64 = 0x0000_0032_B518_5910;

/// Translation-control value with the lower-half walk disabled (EPD0 set);
/// only the kernel half translates.
const TCR_FLAGS_KERNEL: u64 = 0x0000_0032_B518_5990;

/// The hardware implementation of [`ArchOps`].
pub struct Arm64Ops;

impl Arm64Ops {
    /// The shared instance loaded into address spaces at boot.
    pub const fn new() -> Self {
        Self
    }
}

impl Default for Arm64Ops {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchOps for Arm64Ops {
    fn invalidate_tlb_entry(&self, scope: TlbScope, vaddr: VirtualAddress, terminal: bool) {
        let page = (vaddr.as_usize() >> 12) as u64;
        match scope {
            TlbScope::Kernel => {
                // Kernel mappings are global: invalidate the address under
                // every ASID.
                // SAFETY: TLB maintenance has no memory-safety impact beyond
                // forcing a re-walk of the (valid) tables.
                unsafe {
                    if terminal {
                        asm!("tlbi vaale1is, {0}", in(reg) page, options(nostack));
                    } else {
                        asm!("tlbi vaae1is, {0}", in(reg) page, options(nostack));
                    }
                }
            }
            TlbScope::Asid(asid) => {
                let operand = page | ((asid.value() as u64) << 48);
                // SAFETY: As above.
                unsafe {
                    if terminal {
                        asm!("tlbi vale1is, {0}", in(reg) operand, options(nostack));
                    } else {
                        asm!("tlbi vae1is, {0}", in(reg) operand, options(nostack));
                    }
                }
            }
            TlbScope::Vmid { vmid, root } => {
                // Stage-2 invalidation is by intermediate physical address and
                // applies to the VMID currently loaded in VTTBR_EL2.
                VTTBR_EL2.set(((vmid as u64) << 48) | root.as_usize() as u64);
                barrier::isb(barrier::SY);
                // SAFETY: As above.
                unsafe {
                    if terminal {
                        asm!("tlbi ipas2le1is, {0}", in(reg) page, options(nostack));
                    } else {
                        asm!("tlbi ipas2e1is, {0}", in(reg) page, options(nostack));
                    }
                }
            }
        }
    }

    fn invalidate_tlb_all(&self, scope: TlbScope) {
        match scope {
            TlbScope::Kernel => {
                // SAFETY: As for invalidate_tlb_entry.
                unsafe { asm!("tlbi alle1is", options(nostack)) }
            }
            TlbScope::Asid(asid) => {
                let operand = (asid.value() as u64) << 48;
                // SAFETY: As for invalidate_tlb_entry.
                unsafe { asm!("tlbi aside1is, {0}", in(reg) operand, options(nostack)) }
            }
            TlbScope::Vmid { vmid, root } => {
                VTTBR_EL2.set(((vmid as u64) << 48) | root.as_usize() as u64);
                barrier::isb(barrier::SY);
                // SAFETY: As for invalidate_tlb_entry.
                unsafe { asm!("tlbi vmalls12e1is", options(nostack)) }
            }
        }
    }

    fn memory_barrier(&self, kind: Barrier) {
        match kind {
            Barrier::StorePublish => barrier::dmb(barrier::ISHST),
            Barrier::Synchronize => barrier::dsb(barrier::ISH),
        }
    }

    fn load_translation_table(&self, ttbr: u64) {
        TTBR0_EL1.set(ttbr);
        barrier::isb(barrier::SY);
    }

    fn set_translation_mode(&self, mode: TranslationMode) {
        let tcr = match mode {
            TranslationMode::User => TCR_FLAGS_USER,
            TranslationMode::KernelOnly => TCR_FLAGS_KERNEL,
        };
        TCR_EL1.set(tcr);
        barrier::isb(barrier::SY);
    }

    fn zero_page(&self, page: *mut u8) {
        // DCZID_EL0 reports the block size cleared by `dc zva`.
        let dczid: u64;
        // SAFETY: Reading an unprivileged identification register.
        unsafe { asm!("mrs {0}, dczid_el0", out(reg) dczid, options(nostack, nomem)) }
        let stride = 4usize << (dczid & 0xF);

        let mut ptr = page as usize;
        let end = ptr + crate::PAGE_SIZE;
        while ptr != end {
            // SAFETY: The caller hands us one writable, page-aligned page.
            unsafe { asm!("dc zva, {0}", in(reg) ptr, options(nostack)) }
            ptr += stride;
        }
    }

    fn clean_dcache_to_pou(&self, addr: *const u8, len: usize) {
        // CTR_EL0 reports the smallest data-cache line as a power-of-two word
        // count.
        let ctr: u64;
        // SAFETY: Reading an unprivileged identification register.
        unsafe { asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nostack, nomem)) }
        let line = 4usize << ((ctr >> 16) & 0xF);

        let mut ptr = (addr as usize) & !(line - 1);
        let end = addr as usize + len;
        while ptr < end {
            // SAFETY: Cache cleaning of an address range the caller owns.
            unsafe { asm!("dc cvau, {0}", in(reg) ptr, options(nostack)) }
            ptr += line;
        }
        barrier::dsb(barrier::ISH);
    }

    fn invalidate_icache(&self) {
        // SAFETY: Instruction-cache invalidation forces refetch from memory.
        unsafe { asm!("ic ialluis", options(nostack)) }
        barrier::isb(barrier::SY);
    }

    fn yield_cpu(&self) {
        // SAFETY: Spin-loop hint with no architectural side effects.
        unsafe { asm!("yield", options(nostack, nomem)) }
    }
}
