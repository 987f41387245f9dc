//! Component B: the generic page-table engine.
//!
//! Grounded on `mmu_get_page`/`mmu_unmap_page`/`mmu_map_page`/`mmu_find_pte`
//! in `generic_mmu.c`. The C versions recurse (or `goto`) through
//! `mmu_pgtbl_get_child`; we walk iteratively with an explicit `path` stack
//! instead, both on the way down (so we never hold more than one frame
//! lock at a time while allocating) and on the way back up when freeing
//! now-empty frames, with no recursive free.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;

use spin::Mutex;

use crate::arch::{ArchMmu, Page, Stage};
use crate::error::{Error, Result};
use crate::pgtbl::frame::TableLoc;
use crate::pgtbl::pool::FramePool;

/// A single Stage-1 or Stage-2 translation table, backed by a shared
/// [`FramePool`] for its non-root frames.
pub struct PageTable<A: ArchMmu> {
    pool: Arc<FramePool>,
    root: Mutex<Box<[u64]>>,
    stage: Stage,
    root_level: u32,
    _arch: PhantomData<A>,
}

impl<A: ArchMmu> PageTable<A> {
    pub fn new(pool: Arc<FramePool>, stage: Stage) -> Self {
        let root_level = A::start_level(stage);
        let entries = A::level_entry_count(stage, root_level);
        PageTable {
            pool,
            root: Mutex::new(alloc::vec![0u64; entries].into_boxed_slice()),
            stage,
            root_level,
            _arch: PhantomData,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn root_level(&self) -> u32 {
        self.root_level
    }

    fn level_for_size(&self, sz: u64) -> Result<u32> {
        (0..=self.root_level)
            .find(|&level| A::level_block_size(self.stage, level) == sz)
            .ok_or(Error::Invalid)
    }

    fn read_pte(&self, loc: TableLoc, idx: usize) -> Result<u64> {
        match loc {
            TableLoc::Root => Ok(self.root.lock()[idx]),
            TableLoc::Frame(fi) => self.pool.with_frame(fi, |f| f.table[idx]),
        }
    }

    fn write_table_pte(
        &self,
        loc: TableLoc,
        idx: usize,
        level: u32,
        f: impl FnOnce(&mut u64),
    ) -> Result<()> {
        match loc {
            TableLoc::Root => {
                let mut root = self.root.lock();
                f(&mut root[idx]);
                A::pte_sync(&mut root[idx], self.stage, level);
                Ok(())
            }
            TableLoc::Frame(fi) => self.pool.with_frame_mut(fi, |frame| {
                f(&mut frame.table[idx]);
                A::pte_sync(&mut frame.table[idx], self.stage, level);
            }),
        }
    }

    /// Descend from the root toward `target_level`, allocating and
    /// attaching intermediate frames as needed. Returns the location and
    /// index that should hold the leaf descriptor for `ia`.
    fn walk_alloc(&self, ia: u64, target_level: u32) -> Result<(TableLoc, usize)> {
        let mut loc = TableLoc::Root;
        let mut level = self.root_level;
        while level > target_level {
            let idx = A::level_index(ia, self.stage, level);
            let pte = self.read_pte(loc, idx)?;
            let child = if !A::pte_is_valid(pte) {
                let child_map_ia = ia & A::level_map_mask(self.stage, level);
                let child_index = self.pool.alloc(self.stage, level - 1, child_map_ia, loc)?;
                let child_pa = self.pool.with_frame(child_index, |f| f.pa())?;
                self.write_table_pte(loc, idx, level, |pte| {
                    A::pte_set_table(pte, self.stage, level, child_pa);
                })?;
                if let TableLoc::Frame(fi) = loc {
                    self.pool.with_frame_mut(fi, |f| f.child_cnt += 1)?;
                }
                TableLoc::Frame(child_index)
            } else if A::pte_is_table(pte, self.stage, level) {
                let child_pa = A::pte_table_addr(pte);
                TableLoc::Frame(self.pool.find_by_pa(child_pa).ok_or(Error::NotFound)?)
            } else {
                return Err(Error::AlreadyExists);
            };
            loc = child;
            level -= 1;
        }
        Ok((loc, A::level_index(ia, self.stage, target_level)))
    }

    fn tlb_flush(&self, ia: u64, sz: u64) {
        match self.stage {
            Stage::Stage1 => A::stage1_tlbflush(ia, sz),
            Stage::Stage2 => A::stage2_tlbflush(ia, sz),
        }
    }

    /// Install `page`. Fails with [`Error::AlreadyExists`] if any
    /// descriptor along the path (intermediate or leaf) is already
    /// occupied by something else, and with [`Error::Invalid`] for a zero
    /// or architecturally-illegal block size or misaligned address.
    pub fn map_page(&self, page: Page) -> Result<()> {
        if page.sz == 0 {
            return Err(Error::Invalid);
        }
        if page.ia & (page.sz - 1) != 0 || page.oa & (page.sz - 1) != 0 {
            return Err(Error::Invalid);
        }
        if !A::valid_block_size(self.stage, page.sz) {
            return Err(Error::Invalid);
        }
        let level = self.level_for_size(page.sz)?;
        let (loc, idx) = self.walk_alloc(page.ia, level)?;
        if A::pte_is_valid(self.read_pte(loc, idx)?) {
            return Err(Error::AlreadyExists);
        }
        self.write_table_pte(loc, idx, level, |pte| {
            A::pte_set(pte, self.stage, level, page.oa, page.flags);
        })?;
        if let TableLoc::Frame(fi) = loc {
            self.pool.with_frame_mut(fi, |f| f.pte_cnt += 1)?;
        }
        self.tlb_flush(page.ia, page.sz);
        log::debug!(
            "pgtbl: map stage={:?} ia={:#x} oa={:#x} sz={:#x}",
            self.stage,
            page.ia,
            page.oa,
            page.sz
        );
        Ok(())
    }

    /// Look up the mapping covering `ia` without modifying the table.
    pub fn get_page(&self, ia: u64) -> Result<Page> {
        let (pte, level, loc) = self.descend(ia)?;
        let _ = loc;
        let block = A::level_block_size(self.stage, level);
        let offset = ia & (block - 1);
        Ok(Page {
            ia,
            oa: A::pte_addr(pte, self.stage, level) | offset,
            sz: block,
            flags: A::pte_flags(pte, self.stage, level),
        })
    }

    /// Raw descriptor lookup, exposing the level it was resolved at.
    /// Mirrors `mmu_find_pte`; used by the nested walker (F) to inspect a
    /// mapping's flags without reconstructing a [`Page`].
    pub fn find_pte(&self, ia: u64) -> Result<(u64, u32)> {
        let (pte, level, _) = self.descend(ia)?;
        Ok((pte, level))
    }

    fn descend(&self, ia: u64) -> Result<(u64, u32, TableLoc)> {
        let mut loc = TableLoc::Root;
        let mut level = self.root_level;
        loop {
            let idx = A::level_index(ia, self.stage, level);
            let pte = self.read_pte(loc, idx)?;
            if !A::pte_is_valid(pte) {
                return Err(Error::NotFound);
            }
            if level > 0 && A::pte_is_table(pte, self.stage, level) {
                let child_pa = A::pte_table_addr(pte);
                loc = TableLoc::Frame(self.pool.find_by_pa(child_pa).ok_or(Error::NotFound)?);
                level -= 1;
                continue;
            }
            return Ok((pte, level, loc));
        }
    }

    /// Remove the mapping covering `ia`, then free any intermediate
    /// frames left with no remaining children: walk the visited path back
    /// toward the root, stopping at the first frame that still has other
    /// occupants.
    pub fn unmap_page(&self, ia: u64) -> Result<()> {
        let mut path: Vec<(TableLoc, usize, u32)> = Vec::new();
        let mut loc = TableLoc::Root;
        let mut level = self.root_level;
        loop {
            let idx = A::level_index(ia, self.stage, level);
            let pte = self.read_pte(loc, idx)?;
            if !A::pte_is_valid(pte) {
                return Err(Error::NotFound);
            }
            path.push((loc, idx, level));
            if level > 0 && A::pte_is_table(pte, self.stage, level) {
                let child_pa = A::pte_table_addr(pte);
                loc = TableLoc::Frame(self.pool.find_by_pa(child_pa).ok_or(Error::NotFound)?);
                level -= 1;
                continue;
            }
            break;
        }

        let (leaf_loc, leaf_idx, leaf_level) = path[path.len() - 1];
        let sz = A::level_block_size(self.stage, leaf_level);
        self.write_table_pte(leaf_loc, leaf_idx, leaf_level, |pte| A::pte_clear(pte))?;
        if let TableLoc::Frame(fi) = leaf_loc {
            self.pool.with_frame_mut(fi, |f| f.pte_cnt -= 1)?;
        }

        let mut i = path.len() - 1;
        while i > 0 {
            let (loc_i, ..) = path[i];
            let empty = match loc_i {
                TableLoc::Root => false,
                TableLoc::Frame(fi) => self.pool.with_frame(fi, |f| f.is_empty())?,
            };
            if !empty {
                break;
            }
            if let TableLoc::Frame(fi) = loc_i {
                self.pool.free(fi)?;
            }
            let (parent_loc, parent_idx, parent_level) = path[i - 1];
            self.write_table_pte(parent_loc, parent_idx, parent_level, |pte| A::pte_clear(pte))?;
            if let TableLoc::Frame(pfi) = parent_loc {
                self.pool.with_frame_mut(pfi, |f| f.child_cnt -= 1)?;
            }
            i -= 1;
        }

        self.tlb_flush(ia, sz);
        log::debug!("pgtbl: unmap stage={:?} ia={:#x}", self.stage, ia);
        Ok(())
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::arch::{PageFlags, RegionFlags};

    /// A fixed 3-level Sv39x4-shaped `ArchMmu` fake, good enough to drive
    /// the engine's tests without any real CSR or TLB instruction access.
    struct FakeMmu;

    impl ArchMmu for FakeMmu {
        const PGTBL_ENTRIES: usize = 512;
        const PGTBL_SIZE: usize = 512 * 8;

        fn start_level(_stage: Stage) -> u32 {
            2
        }

        fn level_index(ia: u64, _stage: Stage, level: u32) -> usize {
            ((ia >> (12 + 9 * level)) & 0x1ff) as usize
        }

        fn level_block_size(_stage: Stage, level: u32) -> u64 {
            1u64 << (12 + 9 * level)
        }

        fn level_map_mask(_stage: Stage, level: u32) -> u64 {
            !(Self::level_block_size(Stage::Stage1, level) - 1)
        }

        fn valid_block_size(_stage: Stage, sz: u64) -> bool {
            sz == (1 << 12) || sz == (1 << 21) || sz == (1 << 30)
        }

        fn pte_is_valid(pte: u64) -> bool {
            pte & 1 != 0
        }

        fn pte_is_table(pte: u64, _stage: Stage, _level: u32) -> bool {
            pte & 1 != 0 && pte & 0xe == 0
        }

        fn pte_table_addr(pte: u64) -> u64 {
            (pte >> 10) << 12
        }

        fn pte_addr(pte: u64, _stage: Stage, _level: u32) -> u64 {
            (pte >> 10) << 12
        }

        fn pte_set_table(pte: &mut u64, _stage: Stage, _level: u32, child_pa: u64) {
            *pte = ((child_pa >> 12) << 10) | 1;
        }

        fn pte_set(pte: &mut u64, _stage: Stage, _level: u32, oa: u64, flags: PageFlags) {
            *pte = ((oa >> 12) << 10) | 1 | (flags.bits() as u64) << 1;
        }

        fn pte_clear(pte: &mut u64) {
            *pte = 0;
        }

        fn pte_sync(_pte: &mut u64, _stage: Stage, _level: u32) {}

        fn pte_flags(pte: u64, _stage: Stage, _level: u32) -> PageFlags {
            PageFlags::from_bits_truncate(((pte >> 1) & 0xff) as u32)
        }

        fn pgflags_set(region: RegionFlags, _stage: Stage) -> PageFlags {
            let mut flags = PageFlags::VALID;
            if region.contains(RegionFlags::READ) {
                flags |= PageFlags::READ;
            }
            if region.contains(RegionFlags::WRITE) {
                flags |= PageFlags::WRITE;
            }
            flags
        }

        fn stage1_tlbflush(_va: u64, _size: u64) {}
        fn stage2_tlbflush(_ia: u64, _size: u64) {}
        fn hfence_vvma_all() {}
        fn hfence_vvma_asid(_asid: u64) {}
        fn hfence_vvma_va(_va: u64) {}
        fn hfence_vvma_asid_va(_va: u64, _asid: u64) {}
        fn hfence_gvma_all() {}
        fn hfence_gvma(_ia: u64, _size: u64) {}
    }

    fn fresh_table() -> PageTable<FakeMmu> {
        let pool = Arc::new(FramePool::new(16, FakeMmu::PGTBL_ENTRIES));
        PageTable::new(pool, Stage::Stage1)
    }

    #[test]
    fn map_then_get_round_trips() {
        let table = fresh_table();
        let page = Page {
            ia: 0x4000,
            oa: 0x80_4000,
            sz: 1 << 12,
            flags: PageFlags::VALID | PageFlags::READ | PageFlags::WRITE,
        };
        table.map_page(page).unwrap();
        let got = table.get_page(0x4000).unwrap();
        assert_eq!(got.oa, page.oa);
        assert_eq!(got.sz, page.sz);
        assert!(got.flags.contains(PageFlags::WRITE));
    }

    #[test]
    fn mapping_same_ia_twice_fails() {
        let table = fresh_table();
        let page = Page {
            ia: 0x2000,
            oa: 0x90_2000,
            sz: 1 << 12,
            flags: PageFlags::VALID | PageFlags::READ,
        };
        table.map_page(page).unwrap();
        assert_eq!(table.map_page(page), Err(Error::AlreadyExists));
    }

    #[test]
    fn zero_length_page_rejected() {
        let table = fresh_table();
        let page = Page {
            ia: 0,
            oa: 0,
            sz: 0,
            flags: PageFlags::VALID,
        };
        assert_eq!(table.map_page(page), Err(Error::Invalid));
    }

    #[test]
    fn unmap_frees_empty_intermediate_frames() {
        let table = fresh_table();
        let pool_cap_before = table.pool.free_count();
        let page = Page {
            ia: 0x1234_5000,
            oa: 0x7000_0000,
            sz: 1 << 12,
            flags: PageFlags::VALID | PageFlags::READ,
        };
        table.map_page(page).unwrap();
        assert!(table.pool.free_count() < pool_cap_before);
        table.unmap_page(page.ia).unwrap();
        assert_eq!(table.pool.free_count(), pool_cap_before);
        assert_eq!(table.get_page(page.ia), Err(Error::NotFound));
    }

    #[test]
    fn unmap_keeps_sibling_mapping_alive() {
        let table = fresh_table();
        let a = Page {
            ia: 0x1000,
            oa: 0x5000,
            sz: 1 << 12,
            flags: PageFlags::VALID | PageFlags::READ,
        };
        let b = Page {
            ia: 0x2000,
            oa: 0x6000,
            sz: 1 << 12,
            flags: PageFlags::VALID | PageFlags::READ,
        };
        table.map_page(a).unwrap();
        table.map_page(b).unwrap();
        table.unmap_page(a.ia).unwrap();
        assert!(table.get_page(b.ia).is_ok());
    }

    #[test]
    fn unmap_unmapped_address_is_not_found() {
        let table = fresh_table();
        assert_eq!(table.unmap_page(0x9000), Err(Error::NotFound));
    }

    #[test]
    fn superpage_mapping_uses_single_level() {
        let table = fresh_table();
        let page = Page {
            ia: 0x4000_0000,
            oa: 0x8000_0000,
            sz: 1 << 21,
            flags: PageFlags::VALID | PageFlags::READ | PageFlags::EXECUTE,
        };
        table.map_page(page).unwrap();
        let got = table.get_page(0x4000_1000).unwrap();
        assert_eq!(got.sz, 1 << 21);
        assert_eq!(got.ia, 0x4000_1000);
        assert_eq!(got.oa, page.oa + 0x1000);
    }
}
