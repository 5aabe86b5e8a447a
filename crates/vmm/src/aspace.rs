//! Address-space objects and their public contract.
//!
//! An [`AddressSpace`] owns the root page table of one translation regime
//! (kernel, user, or second-stage guest), the identifier its TLB entries are
//! tagged with, and the mutex serializing all operations on its tables. It is
//! the only entry point external callers use; the recursive table work lives
//! in [`crate::walker`] and the TLB batching in [`crate::consistency`].

use spin::Mutex;

use crate::arch::{ArchOps, TlbScope, TranslationMode};
use crate::asid::{self, Asid, AsidsExhausted};
use crate::consistency::ConsistencyManager;
use crate::icache::IcacheConsistencyManager;
use crate::page_alloc::{OutOfMemory, PageAllocator};
use crate::pte::{self, ATTR_NON_GLOBAL, PageTable};
use crate::walker::{self, Regime, Walker};
use crate::{AddressTranslator, MmuFlags, PAGE_SIZE, PhysicalAddress, VirtualAddress, counters};

/// Errors surfaced by address-space operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// Misaligned address or size, or a permission set without read.
    InvalidArgument,
    /// Address outside the address space's configured range.
    OutOfRange,
    /// Page-table page allocation failed.
    OutOfMemory,
    /// The range overlaps an existing valid entry.
    AlreadyMapped,
    /// No mapping exists at the queried address.
    NotFound,
    /// The ASID allocator has no free identifiers.
    AsidsExhausted,
}

impl From<OutOfMemory> for MmuError {
    fn from(_: OutOfMemory) -> Self {
        MmuError::OutOfMemory
    }
}

impl From<AsidsExhausted> for MmuError {
    fn from(_: AsidsExhausted) -> Self {
        MmuError::AsidsExhausted
    }
}

/// What to do with non-terminal entries whose subtrees were not accessed
/// since the last harvest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonTerminalAction {
    /// Keep page tables; only report/clear accessed state. Since the
    /// non-terminal accessed flag is software-emulated here, retaining is a
    /// no-op.
    Retain,
    /// Unmap and free page tables that were not accessed.
    FreeUnaccessed,
}

/// Which translation regime an address space belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Kernel,
    User,
    Guest,
}

/// Lifecycle state of an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Active,
    Destroyed,
}

/// Mutable state of an address space, guarded by its mutex.
struct Inner {
    state: State,
    /// Physical address of the root page table.
    tt_phys: PhysicalAddress,
    /// Identifier tagging this space's TLB entries.
    asid: Asid,
    /// Live page-table pages attributed to this space, root included. Checked
    /// against 1 at destroy to catch mapping leaks.
    pt_pages: usize,
}

/// One hardware address space.
///
/// All operations serialize on the internal mutex; distinct address spaces
/// can be operated on concurrently. The object must stay alive while any CPU
/// uses it as the active translation context.
pub struct AddressSpace {
    kind: Kind,
    base: VirtualAddress,
    size: usize,
    /// VMID for guest spaces, assigned by the hypervisor layer.
    vmid: u16,
    arch: &'static dyn ArchOps,
    allocator: &'static dyn PageAllocator,
    inner: Mutex<Inner>,
}

/// Entries examined per lock acquisition while harvesting accessed flags.
/// Bounds how long a harvest can starve a page-fault handler contending on
/// the same address-space lock.
const MAX_HARVEST_ENTRIES_PER_LOCK: usize = 32;

impl AddressSpace {
    /// Creates an uninitialized user address space covering
    /// `[base, base + size)` in the lower half.
    pub fn new_user(
        base: VirtualAddress,
        size: usize,
        arch: &'static dyn ArchOps,
        allocator: &'static dyn PageAllocator,
    ) -> Self {
        Self::new(Kind::User, base, size, 0, PhysicalAddress::new(0), arch, allocator)
    }

    /// Creates the kernel address space, adopting the statically allocated
    /// root translation table at `root_table`. The kernel space covers the
    /// whole upper half and uses the reserved kernel ASID.
    pub fn new_kernel(
        root_table: PhysicalAddress,
        arch: &'static dyn ArchOps,
        allocator: &'static dyn PageAllocator,
    ) -> Self {
        let regime = Regime::kernel();
        Self::new(
            Kind::Kernel,
            VirtualAddress::new(regime.base),
            regime.span(),
            0,
            root_table,
            arch,
            allocator,
        )
    }

    /// Creates an uninitialized guest (second-stage) address space covering
    /// the intermediate-physical range `[base, base + size)`, with TLB entries
    /// tagged by the caller-assigned `vmid`.
    pub fn new_guest(
        base: VirtualAddress,
        size: usize,
        vmid: u16,
        arch: &'static dyn ArchOps,
        allocator: &'static dyn PageAllocator,
    ) -> Self {
        Self::new(Kind::Guest, base, size, vmid, PhysicalAddress::new(0), arch, allocator)
    }

    fn new(
        kind: Kind,
        base: VirtualAddress,
        size: usize,
        vmid: u16,
        tt_phys: PhysicalAddress,
        arch: &'static dyn ArchOps,
        allocator: &'static dyn PageAllocator,
    ) -> Self {
        Self {
            kind,
            base,
            size,
            vmid,
            arch,
            allocator,
            inner: Mutex::new(Inner {
                state: State::Uninitialized,
                tt_phys,
                asid: Asid::UNUSED,
                pt_pages: 0,
            }),
        }
    }

    fn regime(&self) -> Regime {
        match self.kind {
            Kind::Kernel => Regime::kernel(),
            Kind::User => Regime::user(),
            Kind::Guest => Regime::guest(),
        }
    }

    fn tlb_scope(&self, inner: &Inner) -> TlbScope {
        match self.kind {
            Kind::Kernel => TlbScope::Kernel,
            Kind::User => TlbScope::Asid(inner.asid),
            Kind::Guest => TlbScope::Vmid {
                vmid: self.vmid,
                root: inner.tt_phys,
            },
        }
    }

    /// Encodes mapping flags as attribute bits for this space's entries.
    fn attrs_from_flags(&self, flags: MmuFlags) -> u64 {
        let attrs = pte::attrs_from_flags(self.regime().stage, flags);
        match self.kind {
            // User mappings are not global: they are scoped to this ASID.
            Kind::User => attrs | ATTR_NON_GLOBAL,
            Kind::Kernel | Kind::Guest => attrs,
        }
    }

    /// Returns whether `[vaddr, vaddr + size)` lies within this space's
    /// configured range.
    fn is_valid_range(&self, vaddr: VirtualAddress, size: usize) -> bool {
        let rel = vaddr.as_usize().wrapping_sub(self.base.as_usize());
        rel < self.size && size <= self.size - rel
    }

    /// Validates the shared preconditions of ranged operations.
    fn check_range(&self, vaddr: VirtualAddress, size: usize) -> Result<(), MmuError> {
        if !vaddr.is_aligned(PAGE_SIZE) || size % PAGE_SIZE != 0 {
            log::warn!("range {} + {:#x} not page aligned", vaddr, size);
            return Err(MmuError::InvalidArgument);
        }
        if !self.is_valid_range(vaddr, size) {
            log::warn!(
                "range {} + {:#x} outside address space {} + {:#x}",
                vaddr,
                size,
                self.base,
                self.size
            );
            return Err(MmuError::OutOfRange);
        }
        Ok(())
    }

    /// Activates the address space.
    ///
    /// Kernel spaces adopt the statically allocated root table and the
    /// reserved kernel ASID. Guest and user spaces allocate a zeroed root
    /// table page; user spaces additionally allocate an ASID, and exhaustion
    /// there is fatal to the call.
    pub fn init(&self) -> Result<(), MmuError> {
        log::trace!(
            "init aspace {:?} base {} size {:#x}",
            self.kind,
            self.base,
            self.size
        );

        let mut inner = self.inner.lock();
        assert_eq!(
            inner.state,
            State::Uninitialized,
            "address space initialized twice"
        );
        debug_assert!(self.size >= PAGE_SIZE);
        debug_assert!(self.regime().contains(self.base.as_usize(), self.size));

        match self.kind {
            Kind::Kernel => {
                // The root was linked into the kernel image and handed to the
                // constructor; nothing to allocate.
                inner.asid = Asid::KERNEL;
            }
            Kind::User => {
                let asid = asid::allocator().alloc().inspect_err(|_| {
                    log::error!("out of ASIDs");
                })?;
                match self.alloc_root() {
                    Ok(root) => {
                        inner.tt_phys = root;
                        inner.asid = asid;
                    }
                    Err(err) => {
                        asid::allocator().free(asid);
                        return Err(err.into());
                    }
                }
            }
            Kind::Guest => {
                inner.tt_phys = self.alloc_root()?;
            }
        }

        inner.pt_pages = 1;
        inner.state = State::Active;
        log::trace!("aspace root table at {}", inner.tt_phys);
        Ok(())
    }

    fn alloc_root(&self) -> Result<PhysicalAddress, OutOfMemory> {
        let root = self.allocator.alloc_page().inspect_err(|_| {
            log::error!("failed to allocate root page table");
        })?;
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(root.as_usize());
        self.arch.zero_page(ptr);
        Ok(root)
    }

    /// Tears the address space down.
    ///
    /// Every mapping must already be unmapped; a live mapping or a page-table
    /// accounting mismatch indicates a leak in the layer above and is fatal.
    ///
    /// # Panics
    ///
    /// Panics if called on the kernel space, on an inactive space, or if the
    /// root table is not empty.
    pub fn destroy(&self) {
        log::trace!("destroy aspace {:?} base {}", self.kind, self.base);

        let mut inner = self.inner.lock();
        assert!(
            self.kind != Kind::Kernel,
            "cannot destroy the kernel address space"
        );
        assert_eq!(inner.state, State::Active, "destroying an inactive address space");

        if !walker::table_mut(inner.tt_phys).is_clear() {
            panic!(
                "root page table still in use, aspace base {} root {}",
                self.base, inner.tt_phys
            );
        }
        if inner.pt_pages != 1 {
            panic!(
                "page-table page count is {} at destroy (expected 1), aspace base {}",
                inner.pt_pages, self.base
            );
        }

        // One final whole-space invalidation before the identifier can be
        // reused by someone else.
        self.arch.invalidate_tlb_all(self.tlb_scope(&inner));

        if self.kind == Kind::User {
            asid::allocator().free(inner.asid);
        }
        inner.asid = Asid::UNUSED;

        self.allocator.free_page(inner.tt_phys);
        inner.pt_pages = 0;
        inner.state = State::Destroyed;
    }

    /// Maps `size` bytes of physically contiguous memory at `paddr` to
    /// `vaddr`. Contiguous ranges can be mapped in one descent, allowing
    /// block entries to form where alignment permits.
    ///
    /// Returns the number of bytes mapped. On error nothing is mapped: any
    /// partially installed portion is unwound before returning.
    pub fn map_contiguous(
        &self,
        vaddr: VirtualAddress,
        paddr: PhysicalAddress,
        size: usize,
        flags: MmuFlags,
    ) -> Result<usize, MmuError> {
        log::trace!(
            "map_contiguous vaddr {} paddr {} size {:#x} flags {:?}",
            vaddr,
            paddr,
            size,
            flags
        );

        if !flags.is_readable() {
            return Err(MmuError::InvalidArgument);
        }
        if !paddr.is_aligned(PAGE_SIZE) {
            return Err(MmuError::InvalidArgument);
        }
        self.check_range(vaddr, size)?;
        if size == 0 {
            return Ok(0);
        }

        let regime = self.regime();
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "mapping in an inactive address space");

        if flags.is_executable() {
            // The range may hold freshly written code; make it visible to
            // instruction fetch before it becomes executable.
            let mut icache = IcacheConsistencyManager::new(self.arch);
            let ptr = AddressTranslator::current().phys_to_ptr::<u8>(paddr.as_usize());
            icache.sync_addr(ptr, size);
        }

        let attrs = self.attrs_from_flags(flags);
        let tt_phys = inner.tt_phys;
        let scope = self.tlb_scope(&inner);
        let mut cm = ConsistencyManager::new(self.arch, self.allocator, scope);
        let mut walker = Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);

        walker.map(
            vaddr.as_usize(),
            vaddr.as_usize().wrapping_sub(regime.base),
            paddr.as_usize(),
            size,
            attrs,
            regime.top_index_shift,
            walker::table_mut(tt_phys),
            &mut cm,
        )
    }

    /// Maps the given list of physical pages at consecutive virtual pages
    /// starting at `vaddr`.
    ///
    /// Returns the number of bytes mapped. The call is transactional: if any
    /// page fails to map, every page this call already installed is unmapped
    /// before the error is returned.
    pub fn map(
        &self,
        vaddr: VirtualAddress,
        pages: &[PhysicalAddress],
        flags: MmuFlags,
    ) -> Result<usize, MmuError> {
        log::trace!(
            "map vaddr {} pages {} flags {:?}",
            vaddr,
            pages.len(),
            flags
        );

        if !flags.is_readable() {
            return Err(MmuError::InvalidArgument);
        }
        if pages.iter().any(|page| !page.is_aligned(PAGE_SIZE)) {
            return Err(MmuError::InvalidArgument);
        }
        let size = pages.len() * PAGE_SIZE;
        self.check_range(vaddr, size)?;
        if pages.is_empty() {
            return Ok(0);
        }

        let regime = self.regime();
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "mapping in an inactive address space");

        if flags.is_executable() {
            let mut icache = IcacheConsistencyManager::new(self.arch);
            for page in pages {
                let ptr = AddressTranslator::current().phys_to_ptr::<u8>(page.as_usize());
                icache.sync_addr(ptr, PAGE_SIZE);
            }
        }

        let attrs = self.attrs_from_flags(flags);
        let tt_phys = inner.tt_phys;
        let scope = self.tlb_scope(&inner);
        let mut cm = ConsistencyManager::new(self.arch, self.allocator, scope);
        let mut walker = Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);

        let base_rel = vaddr.as_usize().wrapping_sub(regime.base);
        for (idx, page) in pages.iter().enumerate() {
            let offset = idx * PAGE_SIZE;
            let result = walker.map(
                vaddr.as_usize() + offset,
                base_rel + offset,
                page.as_usize(),
                PAGE_SIZE,
                attrs,
                regime.top_index_shift,
                walker::table_mut(tt_phys),
                &mut cm,
            );
            if let Err(err) = result {
                // The failing call unwound itself; unmap the pages the
                // earlier iterations installed.
                if idx > 0 {
                    walker.unmap(
                        vaddr.as_usize(),
                        base_rel,
                        idx * PAGE_SIZE,
                        regime.top_index_shift,
                        walker::table_mut(tt_phys),
                        &mut cm,
                    );
                }
                return Err(err);
            }
        }

        Ok(size)
    }

    /// Unmaps `[vaddr, vaddr + size)`. Unmapping already-unmapped pages is
    /// not an error; the returned byte count covers only pages that were
    /// actually mapped.
    pub fn unmap(&self, vaddr: VirtualAddress, size: usize) -> Result<usize, MmuError> {
        log::trace!("unmap vaddr {} size {:#x}", vaddr, size);

        self.check_range(vaddr, size)?;
        if size == 0 {
            return Ok(0);
        }

        let regime = self.regime();
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "unmapping in an inactive address space");

        let tt_phys = inner.tt_phys;
        let scope = self.tlb_scope(&inner);
        let mut cm = ConsistencyManager::new(self.arch, self.allocator, scope);
        let mut walker = Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);

        let released = walker.unmap(
            vaddr.as_usize(),
            vaddr.as_usize().wrapping_sub(regime.base),
            size,
            regime.top_index_shift,
            walker::table_mut(tt_phys),
            &mut cm,
        );
        Ok(released)
    }

    /// Changes the permissions of every existing mapping in
    /// `[vaddr, vaddr + size)`, splitting blocks where the range covers them
    /// only partially. Unmapped pages within the range are left alone.
    pub fn protect(
        &self,
        vaddr: VirtualAddress,
        size: usize,
        flags: MmuFlags,
    ) -> Result<(), MmuError> {
        log::trace!("protect vaddr {} size {:#x} flags {:?}", vaddr, size, flags);

        if !flags.is_readable() {
            return Err(MmuError::InvalidArgument);
        }
        self.check_range(vaddr, size)?;
        if size == 0 {
            return Ok(());
        }

        let regime = self.regime();
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "protecting in an inactive address space");

        if flags.is_executable() {
            // Ranges becoming executable need their caches synced, which must
            // happen on CPU-mapped addresses to avoid taking translation
            // faults. Query each page for its physical address; making
            // existing regions executable is uncommon enough to keep this
            // simple.
            counters::PROTECT_MAKE_EXECUTE_CALLS.inc();
            let mut icache = IcacheConsistencyManager::new(self.arch);
            let mut pages_synced = 0u64;
            for offset in (0..size).step_by(PAGE_SIZE) {
                if let Ok((paddr, old_flags)) = self.query_locked(&inner, vaddr + offset) {
                    if old_flags.is_executable() {
                        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(paddr.as_usize());
                        icache.sync_addr(ptr, PAGE_SIZE);
                        pages_synced += 1;
                    }
                }
            }
            counters::PROTECT_MAKE_EXECUTE_PAGES.add(pages_synced);
        }

        let attrs = self.attrs_from_flags(flags);
        let tt_phys = inner.tt_phys;
        let scope = self.tlb_scope(&inner);
        let mut cm = ConsistencyManager::new(self.arch, self.allocator, scope);
        let mut walker = Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);

        walker.protect(
            vaddr.as_usize(),
            vaddr.as_usize().wrapping_sub(regime.base),
            size,
            attrs,
            regime.top_index_shift,
            walker::table_mut(tt_phys),
            &mut cm,
        );
        Ok(())
    }

    /// Translates `vaddr`, returning the physical address and the decoded
    /// permission flags of the mapping covering it.
    pub fn query(&self, vaddr: VirtualAddress) -> Result<(PhysicalAddress, MmuFlags), MmuError> {
        let inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "querying an inactive address space");
        self.query_locked(&inner, vaddr)
    }

    fn query_locked(
        &self,
        inner: &Inner,
        vaddr: VirtualAddress,
    ) -> Result<(PhysicalAddress, MmuFlags), MmuError> {
        if !self.is_valid_range(vaddr, 0) {
            return Err(MmuError::OutOfRange);
        }

        let regime = self.regime();
        let mut index_shift = regime.top_index_shift;
        let mut vaddr_rel = vaddr.as_usize().wrapping_sub(regime.base);
        let mut table: &PageTable = walker::table_mut(inner.tt_phys);

        loop {
            let index = vaddr_rel >> index_shift;
            vaddr_rel -= index << index_shift;
            let pte = table.entry(index);

            if !pte.is_valid() {
                return Err(MmuError::NotFound);
            }
            if pte.is_terminal(index_shift) {
                let paddr = PhysicalAddress::new(pte.output_address().as_usize() + vaddr_rel);
                let flags = pte::flags_from_attrs(regime.stage, pte.attrs());
                log::trace!("query {} -> {} flags {:?}", vaddr, paddr, flags);
                return Ok((paddr, flags));
            }

            assert!(pte.is_table(index_shift), "malformed page table entry");
            table = walker::table_mut(pte.output_address());
            index_shift -= regime.index_step();
        }
    }

    /// Visits the accessed flag of every mapped page in
    /// `[vaddr, vaddr + size)`. For each page whose flag is set, `callback`
    /// receives the physical address, virtual address, and flags, and returns
    /// whether the accessed flag should be cleared.
    ///
    /// The walk runs in bounded batches, releasing the address-space lock and
    /// yielding between them so contending fault handlers are not starved by
    /// a large harvest.
    pub fn harvest_accessed(
        &self,
        vaddr: VirtualAddress,
        size: usize,
        mut callback: impl FnMut(PhysicalAddress, VirtualAddress, MmuFlags) -> bool,
    ) -> Result<(), MmuError> {
        log::trace!("harvest_accessed vaddr {} size {:#x}", vaddr, size);

        self.check_range(vaddr, size)?;

        let regime = self.regime();
        let mut remaining = size;
        let mut cur = vaddr.as_usize();

        while remaining > 0 {
            {
                let mut inner = self.inner.lock();
                assert_eq!(
                    inner.state,
                    State::Active,
                    "harvesting an inactive address space"
                );

                let tt_phys = inner.tt_phys;
                let scope = self.tlb_scope(&inner);
                let mut cm = ConsistencyManager::new(self.arch, self.allocator, scope);
                let mut walker =
                    Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);

                let mut entry_limit = MAX_HARVEST_ENTRIES_PER_LOCK;
                let harvested = walker.harvest_accessed(
                    &mut entry_limit,
                    cur,
                    cur.wrapping_sub(regime.base),
                    remaining,
                    regime.top_index_shift,
                    walker::table_mut(tt_phys),
                    &mut callback,
                    &mut cm,
                );
                debug_assert!(harvested > 0, "harvest must make forward progress");
                debug_assert!(harvested <= remaining);
                remaining -= harvested;
                cur += harvested;
            }

            // The lock is released between batches; give CPUs spinning on it
            // a head start before the next acquisition.
            if remaining > 0 {
                self.arch.yield_cpu();
            }
        }

        Ok(())
    }

    /// Sets the accessed flag on every mapped page in `[vaddr, vaddr + size)`
    /// and on every page table on the way, without TLB maintenance: nothing
    /// relies on promptly observing a cleared flag.
    pub fn mark_accessed(&self, vaddr: VirtualAddress, size: usize) -> Result<(), MmuError> {
        log::trace!("mark_accessed vaddr {} size {:#x}", vaddr, size);

        self.check_range(vaddr, size)?;
        if size == 0 {
            return Ok(());
        }

        let regime = self.regime();
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "marking an inactive address space");

        let tt_phys = inner.tt_phys;
        let mut walker = Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);
        walker.mark_accessed(
            vaddr.as_usize(),
            vaddr.as_usize().wrapping_sub(regime.base),
            size,
            regime.top_index_shift,
            walker::table_mut(tt_phys),
        );
        Ok(())
    }

    /// Frees page tables in `[vaddr, vaddr + size)` whose subtrees were not
    /// accessed since the last pass, unmapping everything below them.
    /// Surviving subtrees have their accessed state cleared so the next pass
    /// starts cold.
    pub fn harvest_non_terminal_accessed(
        &self,
        vaddr: VirtualAddress,
        size: usize,
        action: NonTerminalAction,
    ) -> Result<(), MmuError> {
        log::trace!(
            "harvest_non_terminal_accessed vaddr {} size {:#x} action {:?}",
            vaddr,
            size,
            action
        );

        // The non-terminal accessed flag is software-emulated: with nothing
        // to hand back to hardware, retaining is a no-op.
        if action == NonTerminalAction::Retain {
            return Ok(());
        }

        self.check_range(vaddr, size)?;
        if size == 0 {
            return Ok(());
        }

        let regime = self.regime();
        let mut inner = self.inner.lock();
        assert_eq!(inner.state, State::Active, "harvesting an inactive address space");

        let tt_phys = inner.tt_phys;
        let scope = self.tlb_scope(&inner);
        let mut cm = ConsistencyManager::new(self.arch, self.allocator, scope);
        let mut walker = Walker::new(regime, self.arch, self.allocator, &mut inner.pt_pages);

        walker.free_unaccessed(
            vaddr.as_usize(),
            vaddr.as_usize().wrapping_sub(regime.base),
            size,
            regime.top_index_shift,
            walker::table_mut(tt_phys),
            &mut cm,
        );
        Ok(())
    }
}

/// Switches the active user translation context from `old` to `new`.
///
/// Loads the translation-table register with the new space's root and ASID.
/// Switching to `None` instead disables the lower-half walk entirely, a fast
/// path used just before destroying an address space. Only user spaces can be
/// switch targets; the kernel half stays mapped throughout.
pub fn context_switch(old: Option<&AddressSpace>, new: Option<&AddressSpace>) {
    let arch = new
        .or(old)
        .expect("context switch needs at least one address space")
        .arch;

    match new {
        Some(aspace) => {
            assert!(
                aspace.kind == Kind::User,
                "only user address spaces can become the active context"
            );
            let inner = aspace.inner.lock();
            assert_eq!(
                inner.state,
                State::Active,
                "switching to an inactive address space"
            );
            let ttbr = ((inner.asid.value() as u64) << 48) | inner.tt_phys.as_usize() as u64;
            drop(inner);

            arch.load_translation_table(ttbr);
            // Coming from the kernel-only configuration, the lower-half walk
            // has to be re-enabled as well.
            if old.is_none() {
                arch.set_translation_mode(TranslationMode::User);
            }
            log::trace!("context switch to ttbr {:#x}", ttbr);
        }
        None => {
            arch.set_translation_mode(TranslationMode::KernelOnly);
            arch.load_translation_table(0);
            log::trace!("context switch to kernel-only");
        }
    }
}
