//! Shared test fixtures: an architecture-independent `ArchMmu` fake so
//! unit tests outside `pgtbl::engine` don't need a real RISC-V target
//! (the real `riscv64::Sv39x4` backend issues inline `hfence`/`sfence`
//! assembly that only assembles on that target). Shaped the same as
//! `pgtbl::engine`'s own private fixture: a fixed 3-level Sv39x4-like
//! tree, 512 entries/table, 4 KiB/2 MiB/1 GiB blocks.

#![cfg(test)]

use crate::arch::{ArchMmu, PageFlags, RegionFlags, Stage};

pub struct FakeMmu;

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
        if region.contains(RegionFlags::EXECUTE) {
            flags |= PageFlags::EXECUTE;
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
