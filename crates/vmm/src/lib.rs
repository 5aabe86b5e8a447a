#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Meridian Virtual Memory Manager (VMM)
//!
//! The Meridian Virtual Memory Manager is the architecture-specific address-space
//! layer of the Meridian kernel. It owns the hardware page tables for one 64-bit
//! translation regime (kernel, user, or second-stage guest) and provides:
//!
//! - Mapping, unmapping, and reprotection of page-aligned ranges, including
//!   large-block mappings and block splitting.
//! - Batched TLB invalidation with deferred page-table reuse.
//! - Accessed-flag harvesting and marking for page reclamation, including a
//!   software-emulated accessed flag for non-terminal entries.
//! - Software emulation for testing in non-kernel environments.

extern crate alloc;

mod address;
mod arch;
pub mod asid;
mod aspace;
mod consistency;
mod counters;
mod flags;
mod icache;
mod page_alloc;
mod pte;
mod walker;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use arch::{ArchOps, Barrier, TlbScope, TranslationMode};
pub use asid::{Asid, AsidAllocator, AsidsExhausted};
pub use aspace::{AddressSpace, MmuError, NonTerminalAction, context_switch};
pub use counters::Counter;
pub use flags::{CachePolicy, MmuFlags};
pub use icache::IcacheConsistencyManager;
pub use page_alloc::{OutOfMemory, PageAllocator};
pub use pte::{PAGE_SIZE, PAGE_SIZE_SHIFT};

#[cfg(target_arch = "aarch64")]
pub use arch::Arm64Ops;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{ArchCall, EmulatedMemory, FakeArchOps};
#[cfg(any(test, feature = "software-emulation"))]
pub use asid::EmulatedAsidAllocator;
#[cfg(any(test, feature = "software-emulation"))]
pub use page_alloc::EmulatedPageAllocator;
