//! Component A: the page-table frame pool.
//!
//! Grounded on `mmu_ctrl.pgtbl_{alloc,free,base,nr,max}` and
//! `mmu_pgtbl_alloc`/`mmu_pgtbl_free` in `generic_mmu.c`. The original keeps
//! a free list threaded through `struct mmu_pgtbl.tlink` carved out of a
//! statically-sized array (`mmuctrl.pgtbl_array`, sized from a fraction of
//! VAPOOL). We keep the same fixed-capacity, free-list shape but store
//! frames behind per-slot locks so unrelated subtrees don't serialize on a
//! single pool-wide lock.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;

use crate::arch::Stage;
use crate::error::{Error, Result};
use crate::pgtbl::frame::{Frame, TableLoc};

struct Slot {
    frame: Option<Frame>,
}

/// Fixed-capacity arena of page-table frames.
///
/// Every non-root table frame used by the generic engine (B) is allocated
/// from here. Root frames (including the wider Sv39x4 Stage-2 root) are the
/// host address-space glue's (C) responsibility and are not pool members,
/// mirroring how `def_pgtbl`/`def_pgtbl_tree` in the original are
/// hand-initialized outside the dynamic pool.
pub struct FramePool {
    entries_per_table: usize,
    slots: Vec<Mutex<Slot>>,
    free: Mutex<Vec<u32>>,
    by_pa: Mutex<BTreeMap<u64, u32>>,
}

impl FramePool {
    /// Build a pool with `capacity` frames, each `entries_per_table`
    /// descriptors wide (use `A::PGTBL_ENTRIES` for the non-root shape).
    pub fn new(capacity: usize, entries_per_table: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        let mut free = Vec::with_capacity(capacity);
        for i in 0..capacity {
            slots.push(Mutex::new(Slot { frame: None }));
            free.push((capacity - 1 - i) as u32);
        }
        FramePool {
            entries_per_table,
            slots,
            free: Mutex::new(free),
            by_pa: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Allocate a fresh, zeroed frame and register it in the arena.
    pub fn alloc(&self, stage: Stage, level: u32, map_ia: u64, parent: TableLoc) -> Result<u32> {
        let index = self.free.lock().pop().ok_or(Error::NoMemory)?;
        let frame = Frame::new(index, self.entries_per_table, stage, level, map_ia, parent);
        let pa = frame.pa();
        {
            let mut slot = self.slots[index as usize].lock();
            slot.frame = Some(frame);
        }
        self.by_pa.lock().insert(pa, index);
        log::trace!("pgtbl: alloc frame {index} stage={stage:?} level={level} map_ia={map_ia:#x}");
        Ok(index)
    }

    /// Release a frame back to the free list. Caller must have already
    /// detached it from its parent and ensured `is_empty()`.
    pub fn free(&self, index: u32) -> Result<()> {
        let pa = {
            let mut slot = self.slots[index as usize].lock();
            let frame = slot.frame.take().ok_or(Error::NotFound)?;
            frame.pa()
        };
        self.by_pa.lock().remove(&pa);
        self.free.lock().push(index);
        log::trace!("pgtbl: free frame {index}");
        Ok(())
    }

    pub fn find_by_pa(&self, pa: u64) -> Option<u32> {
        self.by_pa.lock().get(&pa).copied()
    }

    pub fn with_frame<R>(&self, index: u32, f: impl FnOnce(&Frame) -> R) -> Result<R> {
        let slot = self.slots[index as usize].lock();
        let frame = slot.frame.as_ref().ok_or(Error::NotFound)?;
        Ok(f(frame))
    }

    pub fn with_frame_mut<R>(&self, index: u32, f: impl FnOnce(&mut Frame) -> R) -> Result<R> {
        let mut slot = self.slots[index as usize].lock();
        let frame = slot.frame.as_mut().ok_or(Error::NotFound)?;
        Ok(f(frame))
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let pool = FramePool::new(4, 512);
        assert_eq!(pool.free_count(), 4);
        let a = pool.alloc(Stage::Stage1, 1, 0, TableLoc::Root).unwrap();
        let b = pool
            .alloc(Stage::Stage1, 0, 0x1000, TableLoc::Frame(a))
            .unwrap();
        assert_eq!(pool.free_count(), 2);
        pool.free(b).unwrap();
        pool.free(a).unwrap();
        assert_eq!(pool.free_count(), 4);
    }

    #[test]
    fn exhaustion_returns_no_memory() {
        let pool = FramePool::new(1, 512);
        pool.alloc(Stage::Stage1, 0, 0, TableLoc::Root).unwrap();
        assert_eq!(
            pool.alloc(Stage::Stage1, 0, 0, TableLoc::Root),
            Err(Error::NoMemory)
        );
    }

    #[test]
    fn find_by_pa_tracks_live_frames() {
        let pool = FramePool::new(2, 512);
        let a = pool.alloc(Stage::Stage1, 0, 0, TableLoc::Root).unwrap();
        let pa = pool.with_frame(a, |f| f.pa()).unwrap();
        assert_eq!(pool.find_by_pa(pa), Some(a));
        pool.free(a).unwrap();
        assert_eq!(pool.find_by_pa(pa), None);
    }
}
