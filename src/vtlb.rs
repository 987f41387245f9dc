//! Component D: virtual TLB for guest Stage-1 emulation.
//!
//! A guest that runs its own Stage-1 (`satp`) walks guest-virtual to
//! guest-physical addresses; caching that walk's result is the same
//! problem a hardware TLB solves, just done in software on behalf of the
//! emulated guest MMU. We model it as a fixed `LINES`-set, `WAYS`-way
//! cache with round-robin eviction per line and non-global invalidation on
//! ASID changes, the same structural role `mmu_ctrl`'s hypervisor TLB
//! plays for the host side.

use alloc::sync::Arc;

use spin::Mutex;

use crate::arch::{ArchMmu, Page};
use crate::error::Error;
use crate::pgtbl::PageTable;

const PAGE_SHIFT: u32 = 12;

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    valid: bool,
    global: bool,
    va_tag: u64,
    asid: u64,
    page: Page,
}

struct Line<const WAYS: usize> {
    entries: [Entry; WAYS],
    next_victim: usize,
}

impl<const WAYS: usize> Line<WAYS> {
    const fn new() -> Self {
        Line {
            entries: [Entry {
                valid: false,
                global: false,
                va_tag: 0,
                asid: 0,
                page: Page {
                    ia: 0,
                    oa: 0,
                    sz: 0,
                    flags: crate::arch::PageFlags::empty(),
                },
            }; WAYS],
            next_victim: 0,
        }
    }
}

/// `LINES` x `WAYS` set-associative virtual TLB. `LINES` should be a power
/// of two; line selection is a direct mask of the page-aligned VA.
///
/// Beyond the in-memory cache, each entry names a slot in `shadow`, a real
/// Stage-1 page table the guest's vCPU actually runs on. Caching a
/// translation means installing it there; evicting one means tearing it
/// back out, so the hardware TLB and this software directory never
/// disagree about what `shadow` currently maps.
pub struct Vtlb<A: ArchMmu, const LINES: usize, const WAYS: usize> {
    lines: [Mutex<Line<WAYS>>; LINES],
    shadow: Arc<PageTable<A>>,
}

impl<A: ArchMmu, const LINES: usize, const WAYS: usize> Vtlb<A, LINES, WAYS> {
    pub fn new(shadow: Arc<PageTable<A>>) -> Self {
        Vtlb {
            lines: core::array::from_fn(|_| Mutex::new(Line::new())),
            shadow,
        }
    }

    fn line_index(va: u64) -> usize {
        ((va >> PAGE_SHIFT) as usize) & (LINES - 1)
    }

    /// Look up a cached translation for `(va, asid)`. A global entry
    /// matches regardless of `asid`, mirroring hardware TLB ASID-global
    /// behavior for pages mapped with the G bit.
    pub fn lookup(&self, va: u64, asid: u64) -> Option<Page> {
        let line = self.lines[Self::line_index(va)].lock();
        for e in line.entries.iter() {
            if e.valid && e.va_tag == Self::tag(va) && (e.global || e.asid == asid) {
                return Some(e.page);
            }
        }
        None
    }

    fn tag(va: u64) -> u64 {
        va >> PAGE_SHIFT
    }

    /// Cache a translation, evicting whatever the line's round-robin
    /// pointer currently names regardless of whether that slot was
    /// occupied. The evicted entry (if any) is unmapped from `shadow` first;
    /// a shadow table that refuses to unmap its own cached entry means the
    /// cache and the table it backs have already diverged, which is a bug
    /// in the caller, not a recoverable runtime condition.
    pub fn update(&self, va: u64, asid: u64, global: bool, page: Page) {
        let mut line = self.lines[Self::line_index(va)].lock();
        let victim = line.next_victim;
        let prior = line.entries[victim];
        if prior.valid {
            match self.shadow.unmap_page(prior.va_tag << PAGE_SHIFT) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => panic!("vtlb: failed to unmap evicted shadow entry: {e}"),
            }
        }
        // Shadow mappings are always installed non-global: the shadow table
        // serves one ASID context at a time, so globality only matters for
        // this cache's own lookup semantics.
        let mut shadow_page = page;
        shadow_page.ia = va & !(page.sz - 1);
        if let Err(e) = self.shadow.map_page(shadow_page) {
            panic!("vtlb: failed to install shadow entry: {e}");
        }
        line.entries[victim] = Entry {
            valid: true,
            global,
            va_tag: Self::tag(va),
            asid,
            page,
        };
        line.next_victim = (victim + 1) % WAYS;
        log::trace!("vtlb: update va={va:#x} asid={asid} global={global} oa={:#x}", page.oa);
    }

    fn evict_locked(&self, line: &mut Line<WAYS>, idx: usize) {
        let e = &mut line.entries[idx];
        if e.valid {
            match self.shadow.unmap_page(e.va_tag << PAGE_SHIFT) {
                Ok(()) | Err(Error::NotFound) => {}
                Err(err) => panic!("vtlb: failed to unmap shadow entry during flush: {err}"),
            }
            e.valid = false;
        }
    }

    pub fn flush_all(&self) {
        for line in self.lines.iter() {
            let mut line = line.lock();
            for idx in 0..WAYS {
                self.evict_locked(&mut line, idx);
            }
        }
        log::debug!("vtlb: flush_all");
    }

    pub fn flush_va(&self, va: u64) {
        let mut line = self.lines[Self::line_index(va)].lock();
        let tag = Self::tag(va);
        for idx in 0..WAYS {
            if line.entries[idx].valid && line.entries[idx].va_tag == tag {
                self.evict_locked(&mut line, idx);
            }
        }
        log::trace!("vtlb: flush_va va={va:#x}");
    }

    pub fn flush_asid(&self, asid: u64) {
        for line in self.lines.iter() {
            let mut line = line.lock();
            for idx in 0..WAYS {
                if line.entries[idx].valid && !line.entries[idx].global && line.entries[idx].asid == asid {
                    self.evict_locked(&mut line, idx);
                }
            }
        }
        log::trace!("vtlb: flush_asid asid={asid}");
    }

    /// Drop every non-global entry, regardless of ASID. Called when the
    /// guest writes `satp` with a mode/ASID change that the hardware would
    /// otherwise require an explicit `sfence.vma` to observe.
    pub fn flush_nonglobal(&self) {
        for line in self.lines.iter() {
            let mut line = line.lock();
            for idx in 0..WAYS {
                if line.entries[idx].valid && !line.entries[idx].global {
                    self.evict_locked(&mut line, idx);
                }
            }
        }
        log::debug!("vtlb: flush_nonglobal");
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::arch::{PageFlags, Stage};
    use crate::pgtbl::FramePool;
    use crate::testutil::FakeMmu;

    fn page(oa: u64) -> Page {
        Page {
            ia: 0,
            oa,
            sz: 1 << 12,
            flags: PageFlags::VALID | PageFlags::READ,
        }
    }

    fn new_vtlb<const LINES: usize, const WAYS: usize>() -> Vtlb<FakeMmu, LINES, WAYS> {
        let pool = Arc::new(FramePool::new(64, FakeMmu::PGTBL_ENTRIES));
        let shadow = Arc::new(PageTable::new(pool, Stage::Stage1));
        Vtlb::new(shadow)
    }

    #[test]
    fn insert_then_lookup_hits() {
        let vtlb = new_vtlb::<4, 2>();
        vtlb.update(0x1000, 3, false, page(0x9000));
        assert_eq!(vtlb.lookup(0x1000, 3).unwrap().oa, 0x9000);
        assert!(vtlb.lookup(0x1000, 4).is_none());
    }

    #[test]
    fn global_entry_matches_any_asid() {
        let vtlb = new_vtlb::<4, 2>();
        vtlb.update(0x2000, 1, true, page(0xa000));
        assert_eq!(vtlb.lookup(0x2000, 99).unwrap().oa, 0xa000);
    }

    #[test]
    fn round_robin_eviction_wraps() {
        let vtlb = new_vtlb::<1, 2>();
        vtlb.update(0x0000, 1, false, page(0x1000));
        vtlb.update(0x1000, 1, false, page(0x2000));
        // Third insert shares the one line and evicts the first way.
        vtlb.update(0x2000, 1, false, page(0x3000));
        assert!(vtlb.lookup(0x0000, 1).is_none());
        assert!(vtlb.lookup(0x1000, 1).is_some());
    }

    #[test]
    fn flush_nonglobal_keeps_global_entries() {
        let vtlb = new_vtlb::<4, 2>();
        vtlb.update(0x3000, 1, false, page(0x4000));
        vtlb.update(0x5000, 1, true, page(0x6000));
        vtlb.flush_nonglobal();
        assert!(vtlb.lookup(0x3000, 1).is_none());
        assert!(vtlb.lookup(0x5000, 1).is_some());
    }
}
