//! Architecture abstraction for the generic page-table engine.
//!
//! The C source (`arch_mmu_*` in `generic_mmu.c`) implements this family
//! per-target as macros and inline functions. We re-model it as a trait:
//! each supported target provides one [`ArchMmu`] implementation, and
//! level counts / block sizes become associated behaviour instead of
//! `#ifdef`-guarded constants.

#[cfg(target_arch = "riscv64")]
pub mod riscv64;

use bitflags::bitflags;

/// The two translation stages a page table can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Guest-virtual -> guest-physical (or host-virtual -> host-physical
    /// for the hypervisor's own address space).
    Stage1,
    /// Guest-physical -> host-physical.
    Stage2,
}

bitflags! {
    /// Generic, architecture-independent memory region flags as seen by
    /// a caller of the host address-space glue (4.C) or the nested
    /// walker's region lookup. Mirrors `VMM_MEMORY_FLAGS_*` / `VMM_REGION_*`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegionFlags: u32 {
        const READ       = 1 << 0;
        const WRITE      = 1 << 1;
        const EXECUTE    = 1 << 2;
        const CACHEABLE  = 1 << 3;
        const BUFFERABLE = 1 << 4;
        const USER       = 1 << 5;
        /// Backing region is RAM (read/write capable, used by nostage perm checks).
        const IS_RAM     = 1 << 6;
        /// Backing region is ROM (read/fetch only).
        const IS_ROM     = 1 << 7;
    }
}

impl RegionFlags {
    /// A plain read-write-execute cacheable normal-memory region, the
    /// common case for hypervisor reserved memory and guest RAM.
    pub const NORMAL: RegionFlags = RegionFlags::READ
        .union(RegionFlags::WRITE)
        .union(RegionFlags::EXECUTE)
        .union(RegionFlags::CACHEABLE)
        .union(RegionFlags::BUFFERABLE)
        .union(RegionFlags::IS_RAM);
}

bitflags! {
    /// Flags carried by an installed page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u32 {
        const VALID    = 1 << 0;
        const READ     = 1 << 1;
        const WRITE    = 1 << 2;
        const EXECUTE  = 1 << 3;
        const USER     = 1 << 4;
        const GLOBAL   = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY    = 1 << 7;
    }
}

/// A single `(input address, output address, size, flags)` mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Page {
    /// Input address (guest-virtual or guest-physical, depending on stage).
    pub ia: u64,
    /// Output address (guest-physical or host-physical, depending on stage).
    pub oa: u64,
    /// Block size in bytes; must be one of [`ArchMmu::valid_block_size`].
    pub sz: u64,
    pub flags: PageFlags,
}

/// Per-architecture translation-table contract. Implementors provide one
/// instance per supported stage/mode combination; the generic page-table
/// engine (`pgtbl::engine`) is written entirely in terms of this trait.
pub trait ArchMmu {
    /// Number of entries in a non-root translation-table frame.
    const PGTBL_ENTRIES: usize;

    /// Size in bytes of one translation-table frame (and its alignment).
    const PGTBL_SIZE: usize;

    /// The level at which a fresh root frame for `stage` starts walking.
    /// Level 0 is always the leaf level (smallest block size).
    fn start_level(stage: Stage) -> u32;

    /// Entries in the frame at `level` for `stage` (root frames may be
    /// wider than non-root frames, e.g. Sv39x4's 2048-entry G-stage root).
    fn level_entry_count(stage: Stage, level: u32) -> usize {
        let _ = (stage, level);
        Self::PGTBL_ENTRIES
    }

    /// Index into the frame at `level` addressed by `ia`.
    fn level_index(ia: u64, stage: Stage, level: u32) -> usize;

    /// Size in bytes of one block mapped by a leaf descriptor at `level`.
    fn level_block_size(stage: Stage, level: u32) -> u64;

    /// Mask of the address bits a table descriptor at `level` covers, used
    /// to compute a child frame's `map_ia`.
    fn level_map_mask(stage: Stage, level: u32) -> u64;

    /// Whether `sz` is one of this architecture's legal leaf block sizes
    /// for `stage`.
    fn valid_block_size(stage: Stage, sz: u64) -> bool;

    fn pte_is_valid(pte: u64) -> bool;
    fn pte_is_table(pte: u64, stage: Stage, level: u32) -> bool;
    fn pte_table_addr(pte: u64) -> u64;
    fn pte_addr(pte: u64, stage: Stage, level: u32) -> u64;
    fn pte_set_table(pte: &mut u64, stage: Stage, level: u32, child_pa: u64);
    fn pte_set(pte: &mut u64, stage: Stage, level: u32, oa: u64, flags: PageFlags);
    fn pte_clear(pte: &mut u64);
    /// Publish a just-written descriptor (cache clean + barrier as needed).
    fn pte_sync(pte: &mut u64, stage: Stage, level: u32);
    fn pte_flags(pte: u64, stage: Stage, level: u32) -> PageFlags;

    /// Build architecture PTE flags from generic region flags for `stage`.
    fn pgflags_set(region: RegionFlags, stage: Stage) -> PageFlags;

    fn stage1_tlbflush(va: u64, size: u64);
    fn stage2_tlbflush(ia: u64, size: u64);

    fn hfence_vvma_all();
    fn hfence_vvma_asid(asid: u64);
    fn hfence_vvma_va(va: u64);
    fn hfence_vvma_asid_va(va: u64, asid: u64);
    fn hfence_gvma_all();
    fn hfence_gvma(ia: u64, size: u64);
}
