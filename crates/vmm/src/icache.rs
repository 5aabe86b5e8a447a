//! Instruction-cache consistency for executable mappings.
//!
//! Before memory becomes executable through a new or reprotected mapping, any
//! stale instruction-cache contents for it must be discarded. Data caches are
//! cleaned to the point of unification per range; the icache invalidation is
//! batched and performed once when the manager goes out of scope, since the
//! only portable option on a virtually-indexed icache is a full invalidate.

use crate::arch::ArchOps;

/// Scoped batcher for instruction-cache maintenance.
pub struct IcacheConsistencyManager<'a> {
    arch: &'a dyn ArchOps,
    need_invalidate: bool,
}

impl<'a> IcacheConsistencyManager<'a> {
    pub fn new(arch: &'a dyn ArchOps) -> Self {
        Self {
            arch,
            need_invalidate: false,
        }
    }

    /// Makes prior writes to `[addr, addr + len)` visible to instruction
    /// fetch. The address must be CPU-mapped (not a user alias), so cleaning
    /// cannot fault.
    pub fn sync_addr(&mut self, addr: *const u8, len: usize) {
        self.arch.clean_dcache_to_pou(addr, len);
        self.need_invalidate = true;
    }
}

impl Drop for IcacheConsistencyManager<'_> {
    fn drop(&mut self) {
        if self.need_invalidate {
            self.arch.invalidate_icache();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchCall, FakeArchOps};

    #[test]
    fn batches_one_invalidate_for_many_syncs() {
        let arch = FakeArchOps::new();
        {
            let mut cm = IcacheConsistencyManager::new(&arch);
            let buf = [0u8; 64];
            cm.sync_addr(buf.as_ptr(), 64);
            cm.sync_addr(buf.as_ptr(), 32);
        }

        assert_eq!(
            arch.take_calls(),
            vec![
                ArchCall::CleanDcacheToPou { len: 64 },
                ArchCall::CleanDcacheToPou { len: 32 },
                ArchCall::InvalidateIcache,
            ]
        );
    }

    #[test]
    fn no_syncs_means_no_invalidate() {
        let arch = FakeArchOps::new();
        {
            let _cm = IcacheConsistencyManager::new(&arch);
        }
        assert!(arch.take_calls().is_empty());
    }
}
