//! Component E: nested software TLB.
//!
//! Grounded on `nested_swtlb_lookup` / `nested_swtlb_update` / `nested_swtlb_flush`
//! in `cpu_vcpu_nested.c`. The C side keeps two fixed-size arrays
//! (`NESTED_SWTLB_ITLB_MAX_ENTRY` / `_DTLB_`) threaded as a move-to-front
//! list via `next`/`prev` indices with a parallel free list. We keep the
//! same two-cache, move-to-front-on-hit, evict-the-tail shape but replace
//! the hand-rolled intrusive list with an explicit order `Vec<usize>` of
//! slot indices (front = most recently used) plus a free-slot stack,
//! matching this crate's arena-of-indices convention elsewhere.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::{ArchMmu, Page, RegionFlags};
use crate::error::{Error, Result};
use crate::nested::walker::Access;
use crate::pgtbl::PageTable;

/// One cached nested translation.
///
/// `page` is the guest's own view of the mapping (its Stage-2 walk's
/// result, guest-physical in, guest-declared-host-physical out); `shadow`
/// is the real mapping installed in the hardware-visible nested Stage-2
/// table after nostage resolves `page.oa` to an actual host address.
#[derive(Debug, Clone, Copy, Default)]
struct SwtlbEntry {
    valid: bool,
    gpa_tag: u64,
    page: Page,
    shadow: Page,
    region: RegionFlags,
}

/// One instruction- or data-side sub-cache: `N` entries, move-to-front on
/// hit, evict the tail on a miss with no free slot.
struct Xtlb<const N: usize> {
    entries: [SwtlbEntry; N],
    /// Slot indices in MRU-first order. Only valid slots appear here.
    order: Vec<usize>,
    free: Vec<usize>,
}

impl<const N: usize> Xtlb<N> {
    fn new() -> Self {
        Xtlb {
            entries: [SwtlbEntry::default(); N],
            order: Vec::with_capacity(N),
            free: (0..N).rev().collect(),
        }
    }

    fn find(&self, gpa_tag: u64) -> Option<usize> {
        self.order.iter().position(|&i| self.entries[i].gpa_tag == gpa_tag)
    }

    fn promote(&mut self, pos: usize) {
        let idx = self.order.remove(pos);
        self.order.insert(0, idx);
    }

    fn lookup(&mut self, gpa_tag: u64) -> Option<(Page, RegionFlags)> {
        let pos = self.find(gpa_tag)?;
        let idx = self.order[pos];
        self.promote(pos);
        let e = &self.entries[idx];
        Some((e.shadow, e.region))
    }

    /// Claim a slot for a fresh entry, returning the index of whatever
    /// entry (if any) must first be unmapped from the shadow table.
    fn claim_slot(&mut self) -> (usize, Option<SwtlbEntry>) {
        if let Some(idx) = self.free.pop() {
            (idx, None)
        } else {
            let idx = self.order.pop().expect("N > 0 sub-cache has no free slot and empty order");
            let victim = self.entries[idx];
            (idx, Some(victim))
        }
    }

    fn install(&mut self, idx: usize, entry: SwtlbEntry) {
        self.entries[idx] = entry;
        self.order.insert(0, idx);
    }

    fn evict_all(&mut self) -> Vec<SwtlbEntry> {
        let evicted = self.order.iter().map(|&i| self.entries[i]).collect::<Vec<_>>();
        for idx in self.order.drain(..) {
            self.entries[idx] = SwtlbEntry::default();
            self.free.push(idx);
        }
        evicted
    }

    fn evict_range(&mut self, start: u64, end: u64) -> Vec<SwtlbEntry> {
        let mut evicted = Vec::new();
        let mut pos = 0;
        while pos < self.order.len() {
            let idx = self.order[pos];
            let e = &self.entries[idx];
            let e_start = e.gpa_tag;
            let e_end = e_start + e.shadow.sz.max(1);
            if e_start < end && e_end > start {
                evicted.push(*e);
                self.order.remove(pos);
                self.entries[idx] = SwtlbEntry::default();
                self.free.push(idx);
            } else {
                pos += 1;
            }
        }
        evicted
    }
}

/// Split instruction/data nested software TLB, backed by a real shadow
/// Stage-2 page table that every cached entry keeps in sync with.
pub struct NestedSwTlb<A: ArchMmu, const ITLB: usize, const DTLB: usize> {
    itlb: Mutex<Xtlb<ITLB>>,
    dtlb: Mutex<Xtlb<DTLB>>,
    shadow: Arc<PageTable<A>>,
}

impl<A: ArchMmu, const ITLB: usize, const DTLB: usize> NestedSwTlb<A, ITLB, DTLB> {
    pub fn new(shadow: Arc<PageTable<A>>) -> Self {
        NestedSwTlb {
            itlb: Mutex::new(Xtlb::new()),
            dtlb: Mutex::new(Xtlb::new()),
            shadow,
        }
    }

    pub fn shadow(&self) -> &Arc<PageTable<A>> {
        &self.shadow
    }

    /// Look up a cached nested translation for `gpa`, split by access kind
    /// the same way hardware splits ITLB/DTLB lookups.
    pub fn lookup(&self, access: Access, gpa: u64) -> Option<(Page, RegionFlags)> {
        match access {
            Access::Fetch => self.itlb.lock().lookup(gpa),
            Access::Read | Access::Write => self.dtlb.lock().lookup(gpa),
        }
    }

    fn unmap_shadow(&self, e: &SwtlbEntry) {
        match self.shadow.unmap_page(e.shadow.ia) {
            Ok(()) | Err(Error::NotFound) => {}
            Err(err) => panic!("nested swtlb: failed to unmap shadow entry: {err}"),
        }
    }

    /// Cache a freshly resolved translation, installing `shadow` into the
    /// real nested Stage-2 table. If the cache is full the least-recently
    /// used entry is evicted and its shadow mapping torn down first; a
    /// shadow unmap failure on an entry this cache itself installed means
    /// the engine's invariants are already broken, so it panics rather
    /// than return an error the caller could paper over.
    pub fn update(&self, access: Access, gpa: u64, page: Page, shadow: Page, region: RegionFlags) -> Result<()> {
        let cache = match access {
            Access::Fetch => &self.itlb,
            Access::Read | Access::Write => &self.dtlb,
        };
        let mut cache = cache.lock();
        if let Some(pos) = cache.find(gpa) {
            let idx = cache.order[pos];
            self.unmap_shadow(&cache.entries[idx]);
            cache.order.remove(pos);
            cache.entries[idx] = SwtlbEntry::default();
            cache.free.push(idx);
        }
        let (idx, victim) = cache.claim_slot();
        if let Some(victim) = victim {
            self.unmap_shadow(&victim);
        }
        self.shadow.map_page(shadow)?;
        cache.install(
            idx,
            SwtlbEntry {
                valid: true,
                gpa_tag: gpa,
                page,
                shadow,
                region,
            },
        );
        log::trace!("nested swtlb: update access={access:?} gpa={gpa:#x} shadow_oa={:#x}", shadow.oa);
        Ok(())
    }

    /// Flush `[start, start+size)`; `(0, 0)` is the "flush everything"
    /// sentinel, matching `nested_swtlb_flush`'s convention.
    pub fn flush(&self, start: u64, size: u64) {
        let (itlb_evicted, dtlb_evicted) = if start == 0 && size == 0 {
            (self.itlb.lock().evict_all(), self.dtlb.lock().evict_all())
        } else {
            let end = start + size;
            (self.itlb.lock().evict_range(start, end), self.dtlb.lock().evict_range(start, end))
        };
        let count = itlb_evicted.len() + dtlb_evicted.len();
        for e in itlb_evicted.iter().chain(dtlb_evicted.iter()) {
            self.unmap_shadow(e);
        }
        log::debug!("nested swtlb: flush start={start:#x} size={size:#x} evicted={count}");
    }

    /// Number of host pages currently installed by this cache's entries
    /// (used by tests to check the "flush_all empties the shadow table"
    /// invariant).
    pub fn mapped_count(&self) -> usize {
        self.itlb.lock().order.len() + self.dtlb.lock().order.len()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::arch::{PageFlags, Stage};
    use crate::pgtbl::FramePool;
    use crate::testutil::FakeMmu;

    fn shadow_table() -> Arc<PageTable<FakeMmu>> {
        let pool = Arc::new(FramePool::new(256, FakeMmu::PGTBL_ENTRIES));
        Arc::new(PageTable::new(pool, Stage::Stage2))
    }

    fn page(ia: u64, oa: u64) -> Page {
        Page {
            ia,
            oa,
            sz: 0x1000,
            flags: PageFlags::VALID | PageFlags::READ | PageFlags::WRITE,
        }
    }

    #[test]
    fn insert_then_lookup_hits_data_cache() {
        let swtlb: NestedSwTlb<FakeMmu, 4, 4> = NestedSwTlb::new(shadow_table());
        let p = page(0x8000_1000, 0xc000_1000);
        swtlb.update(Access::Read, 0x8000_1000, p, p, RegionFlags::NORMAL).unwrap();
        let (hit, _) = swtlb.lookup(Access::Read, 0x8000_1000).unwrap();
        assert_eq!(hit.oa, 0xc000_1000);
        assert!(swtlb.lookup(Access::Fetch, 0x8000_1000).is_none());
    }

    #[test]
    fn nplus1_insert_evicts_exactly_one_and_shadow_reflects_it() {
        const N: usize = 4;
        let swtlb: NestedSwTlb<FakeMmu, 4, N> = NestedSwTlb::new(shadow_table());
        for i in 0..=N {
            let gpa = 0x8000_0000u64 + (i as u64) * 0x1000;
            let hpa = 0xc000_0000u64 + (i as u64) * 0x1000;
            let p = page(gpa, hpa);
            swtlb.update(Access::Read, gpa, p, p, RegionFlags::NORMAL).unwrap();
        }
        assert_eq!(swtlb.mapped_count(), N);
        // The first inserted page (least-recently used) must have been evicted.
        assert!(swtlb.lookup(Access::Read, 0x8000_0000).is_none());
        assert!(swtlb.shadow.get_page(0x8000_0000).is_err());
        // The last N pages remain cached and installed.
        for i in 1..=N {
            let gpa = 0x8000_0000u64 + (i as u64) * 0x1000;
            assert!(swtlb.lookup(Access::Read, gpa).is_some());
        }
    }

    #[test]
    fn flush_all_empties_shadow_table() {
        let swtlb: NestedSwTlb<FakeMmu, 4, 4> = NestedSwTlb::new(shadow_table());
        for i in 0..3 {
            let gpa = 0x9000_0000u64 + (i as u64) * 0x1000;
            let hpa = 0xd000_0000u64 + (i as u64) * 0x1000;
            let p = page(gpa, hpa);
            swtlb.update(Access::Read, gpa, p, p, RegionFlags::NORMAL).unwrap();
        }
        swtlb.flush(0, 0);
        assert_eq!(swtlb.mapped_count(), 0);
        for i in 0..3 {
            let gpa = 0x9000_0000u64 + (i as u64) * 0x1000;
            assert!(swtlb.shadow.get_page(gpa).is_err());
        }
    }

    #[test]
    fn ranged_flush_only_touches_overlapping_entries() {
        let swtlb: NestedSwTlb<FakeMmu, 4, 4> = NestedSwTlb::new(shadow_table());
        let a = page(0xa000_0000, 0xe000_0000);
        let b = page(0xb000_0000, 0xf000_0000);
        swtlb.update(Access::Read, 0xa000_0000, a, a, RegionFlags::NORMAL).unwrap();
        swtlb.update(Access::Read, 0xb000_0000, b, b, RegionFlags::NORMAL).unwrap();
        swtlb.flush(0xa000_0000, 0x1000);
        assert!(swtlb.lookup(Access::Read, 0xa000_0000).is_none());
        assert!(swtlb.lookup(Access::Read, 0xb000_0000).is_some());
    }
}
