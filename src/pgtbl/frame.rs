//! A single page-table frame.
//!
//! The C original (`struct mmu_pgtbl`) is an intrusive tree node: it embeds
//! parent/child/free-list pointers directly alongside the table memory and
//! a `vmm_spinlock_t` for serialized attach/detach. We keep the metadata
//! but drop the raw pointers: a frame only ever refers to other frames by
//! `u32` index into its owning [`crate::pgtbl::pool::FramePool`], and the
//! table memory itself is a heap allocation owned by the `Frame` rather
//! than carved out of a static array.

use alloc::boxed::Box;

use crate::arch::Stage;

/// Identifies a table without caring whether it is a pool frame or the
/// (externally-owned) root of a [`crate::pgtbl::engine::PageTable`]. Root
/// tables are never pool members, so a plain `u32` index cannot name one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLoc {
    Root,
    Frame(u32),
}

/// One page-table frame: a translation-table page plus the bookkeeping the
/// generic engine (B) needs to walk, attach, and free it without recursion.
pub struct Frame {
    /// Pool slot index, stored so a frame can report its own identity.
    pub index: u32,
    /// Raw table contents, `entries_per_table` `u64` descriptors wide.
    pub table: Box<[u64]>,
    /// Base input address this frame's span begins at (aligned to its
    /// parent's block size, or 0 for a root frame).
    pub map_ia: u64,
    pub stage: Stage,
    /// Level this frame sits at; 0 is always the leaf level.
    pub level: u32,
    /// Location of the table that holds the descriptor pointing at this
    /// frame.
    pub parent: TableLoc,
    /// Count of directly-installed leaf descriptors.
    pub pte_cnt: u32,
    /// Count of directly-installed table (child) descriptors.
    pub child_cnt: u32,
}

impl Frame {
    pub(crate) fn new(
        index: u32,
        entries_per_table: usize,
        stage: Stage,
        level: u32,
        map_ia: u64,
        parent: TableLoc,
    ) -> Self {
        Frame {
            index,
            table: alloc::vec![0u64; entries_per_table].into_boxed_slice(),
            map_ia,
            stage,
            level,
            parent,
            pte_cnt: 0,
            child_cnt: 0,
        }
    }

    /// Identity physical address for this frame's table memory. This
    /// library has no real phys/virt split (that lives in the hosting
    /// address-space glue); the table's heap address stands in for it so
    /// `find_by_pa`-style lookups behave like the original's
    /// `mmu_pgtbl_find`.
    pub fn pa(&self) -> u64 {
        self.table.as_ptr() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.pte_cnt == 0 && self.child_cnt == 0
    }

    pub fn entries(&self) -> usize {
        self.table.len()
    }
}
