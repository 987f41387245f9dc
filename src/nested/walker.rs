//! Component F: the nested walker (nostage / gstage / vsstage).
//!
//! Grounded on `nested_xlate_nostage(_single)`, `nested_xlate_gstage`, and
//! `nested_xlate_vsstage` in `cpu_vcpu_nested.c`. The three contexts share
//! one shape: look in a cache (trivial for nostage, the software TLB for
//! gstage, the virtual TLB for vsstage — the latter lives in `crate::vtlb`
//! and is driven by the caller, not this module), walk an in-memory table
//! on a miss, check permissions once at the final level, and turn the
//! first failing check into a populated [`Trap`] rather than a plain error.

use crate::arch::{ArchMmu, Page, PageFlags, RegionFlags, Stage};
use crate::error::{Error, Result};
use crate::nested::swtlb::NestedSwTlb;

/// RISC-V `scause` values this walker produces. Only the subset the
/// nested translator touches, not the full architectural list.
pub mod cause {
    pub const INTERRUPT_BIT: u64 = 1 << 63;
    pub const INSN_PAGE_FAULT: u64 = 12;
    pub const LOAD_PAGE_FAULT: u64 = 13;
    pub const STORE_PAGE_FAULT: u64 = 15;
    pub const INSN_GUEST_PAGE_FAULT: u64 = 20;
    pub const LOAD_GUEST_PAGE_FAULT: u64 = 21;
    pub const VIRTUAL_INSTRUCTION: u64 = 22;
    pub const STORE_GUEST_PAGE_FAULT: u64 = 23;
    /// Timer interrupt bit within `hvip`/`vsie`, used by the take-vsirq
    /// state machine; kept here alongside the other cause codes since
    /// both are "this is what scause/hvip bits mean" constants.
    pub const VS_TIMER_IRQ: u64 = 6;
    pub const VS_EXTERNAL_IRQ: u64 = 10;
    pub const VS_SOFTWARE_IRQ: u64 = 2;
}

/// The access kind that triggered a translation. Determines which region
/// permission nostage requires and which sub-cache a gstage lookup
/// consults, and which fault-class `scause` a failure produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Fetch,
}

/// A trap descriptor to be injected into the virtual hypervisor.
/// `htinst` is passed through unchanged when the trap originates from
/// hardware, so callers that do not have a decoded instruction should
/// set it to `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trap {
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub htval: u64,
    pub htinst: u64,
}

impl Trap {
    /// Build a guest-page-fault trap for a failed gstage translation:
    /// `htval = gpa >> 2`, the architectural shift for a guest-physical
    /// faulting address, `stval` the original guest address that
    /// triggered the walk.
    fn guest_page_fault(access: Access, sepc: u64, stval: u64, gpa: u64) -> Trap {
        let scause = match access {
            Access::Fetch => cause::INSN_GUEST_PAGE_FAULT,
            Access::Read => cause::LOAD_GUEST_PAGE_FAULT,
            Access::Write => cause::STORE_GUEST_PAGE_FAULT,
        };
        Trap {
            sepc,
            scause,
            stval,
            htval: gpa >> 2,
            htinst: 0,
        }
    }

    /// Build a plain (non-guest) page-fault trap for a failed vsstage
    /// translation: from the nested guest's own point of view this looks
    /// like an ordinary Stage-1 fault, not a Stage-2 one.
    fn page_fault(access: Access, sepc: u64, stval: u64) -> Trap {
        let scause = match access {
            Access::Fetch => cause::INSN_PAGE_FAULT,
            Access::Read => cause::LOAD_PAGE_FAULT,
            Access::Write => cause::STORE_PAGE_FAULT,
        };
        Trap {
            sepc,
            scause,
            stval,
            htval: 0,
            htinst: 0,
        }
    }
}

/// External collaborator standing in for `vmm_guest_physical_map`/
/// `axmm::AddrSpace` region lookup. Given a guest-physical address
/// and a requested probe size, returns the host-physical address it maps
/// to, how many bytes of the probe size are actually backed by the same
/// contiguous region, and that region's flags.
///
/// `read_host_u64` additionally stands in for a direct, non-blocking read
/// of host physical memory — the nested walker uses it to dereference
/// page-table entries once nostage has resolved their address, rather
/// than assuming an identity-mapped linear window.
pub trait GuestPhysicalMap {
    fn guest_physical_map(&self, gpa: u64, size: u64) -> Result<(u64, u64, RegionFlags)>;
    fn read_host_u64(&self, host_pa: u64) -> Result<u64>;
}

fn region_required(access: Access) -> RegionFlags {
    match access {
        Access::Read | Access::Fetch => RegionFlags::IS_RAM | RegionFlags::IS_ROM,
        Access::Write => RegionFlags::IS_RAM,
    }
}

/// Guest-host-physical -> host-physical. Tries the three legal Stage-2
/// block sizes and returns the largest aligned mapping that fits entirely
/// inside one region.
pub fn nostage_translate<A: ArchMmu>(map: &impl GuestPhysicalMap, access: Access, gpa: u64) -> Result<Page> {
    let required = region_required(access);
    for level in [2u32, 1, 0] {
        let size = A::level_block_size(Stage::Stage2, level);
        if size == 0 || !A::valid_block_size(Stage::Stage2, size) {
            continue;
        }
        let base = gpa & !(size - 1);
        if let Ok((host_pa, avail, flags)) = map.guest_physical_map(base, size) {
            if avail >= size && flags.intersects(required) {
                return Ok(Page {
                    ia: gpa,
                    oa: host_pa | (gpa & (size - 1)),
                    sz: size,
                    flags: A::pgflags_set(flags, Stage::Stage2),
                });
            }
        }
    }
    log::trace!("nested walker: nostage_translate miss gpa={gpa:#x} access={access:?}");
    Err(Error::Fault)
}

/// The guest's declared Stage-2 translation mode (its `hgatp`-equivalent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage2Mode {
    Off,
    Sv39x4,
}

/// The guest's own Stage-2 state as seen by the nested walker: just
/// enough to know whether translation is active and, if so, where its
/// root table lives and under which VMID the software TLB caches it.
#[derive(Debug, Clone, Copy)]
pub struct GstageContext {
    pub mode: Stage2Mode,
    pub root_gpa: u64,
    pub vmid: u64,
}

fn pte_perm_ok(access: Access, flags: PageFlags) -> bool {
    if !flags.contains(PageFlags::VALID) {
        return false;
    }
    match access {
        Access::Read => flags.contains(PageFlags::READ),
        Access::Write => flags.contains(PageFlags::WRITE),
        Access::Fetch => flags.contains(PageFlags::EXECUTE),
    }
}

/// Walk the guest-owned Stage-2 table rooted at `ctx.root_gpa`, using
/// `nostage` to dereference each guest-physical pointer along the way.
/// Returns the matched leaf's output address, block size, and flags.
fn walk_guest_stage2<A: ArchMmu>(
    map: &impl GuestPhysicalMap,
    ctx: &GstageContext,
    access: Access,
    gpa: u64,
) -> Result<(u64, u64, PageFlags)> {
    let mut table_gpa = ctx.root_gpa;
    let mut level = A::start_level(Stage::Stage2);
    loop {
        let idx = A::level_index(gpa, Stage::Stage2, level);
        let entries = A::level_entry_count(Stage::Stage2, level) as u64;
        let pte_gpa = table_gpa + (idx as u64 % entries) * 8;
        let pte_slot = nostage_translate::<A>(map, Access::Read, pte_gpa)?;
        let pte = map.read_host_u64(pte_slot.oa)?;
        if !A::pte_is_valid(pte) {
            return Err(Error::Fault);
        }
        if A::pte_is_table(pte, Stage::Stage2, level) {
            table_gpa = A::pte_table_addr(pte);
            if level == 0 {
                return Err(Error::Fault);
            }
            level -= 1;
            continue;
        }
        let flags = A::pte_flags(pte, Stage::Stage2, level);
        if !pte_perm_ok(access, flags) {
            return Err(Error::Fault);
        }
        let size = A::level_block_size(Stage::Stage2, level);
        let base = A::pte_addr(pte, Stage::Stage2, level);
        let offset = gpa & (size - 1);
        return Ok((base | offset, size, flags));
    }
}

/// guest-physical -> host-physical. Consults the software TLB
/// first; on miss, walks the guest's Stage-2 table and caches the
/// result, installing the real host mapping into the shadow table the
/// cache owns.
#[allow(clippy::too_many_arguments)]
pub fn gstage_translate<A: ArchMmu, const ITLB: usize, const DTLB: usize>(
    ctx: &GstageContext,
    map: &impl GuestPhysicalMap,
    swtlb: &NestedSwTlb<A, ITLB, DTLB>,
    access: Access,
    sepc: u64,
    gpa: u64,
) -> core::result::Result<Page, Trap> {
    if ctx.mode == Stage2Mode::Off {
        return nostage_translate::<A>(map, access, gpa).map_err(|_| Trap::guest_page_fault(access, sepc, gpa, gpa));
    }
    // The software TLB and the shadow table it installs into always work
    // at the smallest (page) granularity: the guest's own Stage-2 leaf may
    // be a block far larger than one page, but caching/shadowing one page
    // at a time keeps the cache key (page-aligned gpa) identical on both
    // the lookup and the install path, and never straddles two swtlb
    // entries across a single shadow block.
    let page_size = shadow_granule::<A>();
    let base_gpa = gpa & !(page_size - 1);
    if let Some((shadow, _region)) = swtlb.lookup(access, base_gpa) {
        let offset = gpa & (page_size - 1);
        return Ok(Page {
            ia: gpa,
            oa: shadow.oa | offset,
            sz: page_size,
            flags: shadow.flags,
        });
    }
    let (mapped_gpa, _size, pte_flags) = walk_guest_stage2::<A>(map, ctx, access, gpa)
        .map_err(|_| Trap::guest_page_fault(access, sepc, gpa, gpa))?;
    let mapped_base = mapped_gpa & !(page_size - 1);
    let host = nostage_translate::<A>(map, access, mapped_base)
        .map_err(|_| Trap::guest_page_fault(access, sepc, gpa, gpa))?;
    let region = page_region_of(host.flags);
    let page = Page {
        ia: base_gpa,
        oa: mapped_base,
        sz: page_size,
        flags: pte_flags,
    };
    let shadow_page = Page {
        ia: base_gpa,
        oa: host.oa,
        sz: page_size,
        flags: pte_flags,
    };
    if swtlb.update(access, base_gpa, page, shadow_page, region).is_err() {
        return Err(Trap::guest_page_fault(access, sepc, gpa, gpa));
    }
    log::trace!("nested walker: gstage_translate filled gpa={base_gpa:#x} oa={:#x}", shadow_page.oa);
    Ok(Page {
        ia: gpa,
        oa: shadow_page.oa | (gpa & (page_size - 1)),
        sz: page_size,
        flags: pte_flags,
    })
}

fn shadow_granule<A: ArchMmu>() -> u64 {
    A::level_block_size(Stage::Stage2, 0)
}

fn page_region_of(flags: PageFlags) -> RegionFlags {
    let mut r = RegionFlags::IS_RAM;
    if flags.contains(PageFlags::READ) {
        r |= RegionFlags::READ;
    }
    if flags.contains(PageFlags::WRITE) {
        r |= RegionFlags::WRITE;
    }
    if flags.contains(PageFlags::EXECUTE) {
        r |= RegionFlags::EXECUTE;
    }
    r
}

/// The guest's declared Stage-1 translation mode (its `satp`-equivalent)
/// as emulated for the virtual-VS guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage1Mode {
    Off,
    Sv39,
}

#[derive(Debug, Clone, Copy)]
pub struct VsstageContext {
    pub mode: Stage1Mode,
    pub root_gpa: u64,
    pub asid: u64,
    /// `sstatus.SUM`: supervisor may access user pages.
    pub sum: bool,
    /// `sstatus.MXR`: executable pages are also readable.
    pub mxr: bool,
    /// Resuming privilege is supervisor (`hstatus.SPVP`), used for the
    /// supervisor-vs-user access class check.
    pub supervisor: bool,
}

fn walk_guest_stage1<A: ArchMmu, const ITLB: usize, const DTLB: usize>(
    gctx: &GstageContext,
    vctx: &VsstageContext,
    map: &impl GuestPhysicalMap,
    swtlb: &NestedSwTlb<A, ITLB, DTLB>,
    sepc: u64,
    access: Access,
    gva: u64,
) -> core::result::Result<(u64, u64, PageFlags), Trap> {
    let mut table_gpa = vctx.root_gpa;
    let mut level = A::start_level(Stage::Stage1);
    loop {
        let idx = A::level_index(gva, Stage::Stage1, level);
        let entries = A::level_entry_count(Stage::Stage1, level) as u64;
        let pte_gpa = table_gpa + (idx as u64 % entries) * 8;
        let pte_slot = gstage_translate(gctx, map, swtlb, Access::Read, sepc, pte_gpa)?;
        let pte = map.read_host_u64(pte_slot.oa).map_err(|_| Trap::page_fault(access, sepc, gva))?;
        if !A::pte_is_valid(pte) {
            return Err(Trap::page_fault(access, sepc, gva));
        }
        if A::pte_is_table(pte, Stage::Stage1, level) {
            table_gpa = A::pte_table_addr(pte);
            if level == 0 {
                return Err(Trap::page_fault(access, sepc, gva));
            }
            level -= 1;
            continue;
        }
        let flags = A::pte_flags(pte, Stage::Stage1, level);
        if !stage1_perm_ok(access, flags, vctx) {
            return Err(Trap::page_fault(access, sepc, gva));
        }
        let size = A::level_block_size(Stage::Stage1, level);
        let base = A::pte_addr(pte, Stage::Stage1, level);
        let offset = gva & (size - 1);
        return Ok((base | offset, size, flags));
    }
}

fn stage1_perm_ok(access: Access, flags: PageFlags, vctx: &VsstageContext) -> bool {
    if !flags.contains(PageFlags::VALID) {
        return false;
    }
    if flags.contains(PageFlags::USER) && vctx.supervisor && !vctx.sum {
        return false;
    }
    match access {
        Access::Read => flags.contains(PageFlags::READ) || (vctx.mxr && flags.contains(PageFlags::EXECUTE)),
        Access::Write => flags.contains(PageFlags::WRITE),
        Access::Fetch => flags.contains(PageFlags::EXECUTE),
    }
}

/// guest-virtual -> host-physical: one level above gstage,
/// walking the emulated guest's own Stage-1 table and calling
/// [`gstage_translate`] to dereference each of its pointers. A failure at
/// this level is reported as the ordinary (non-guest) page fault the
/// nested guest's own trap handler expects, not a guest-page-fault.
pub fn vsstage_translate<A: ArchMmu, const ITLB: usize, const DTLB: usize>(
    gctx: &GstageContext,
    vctx: &VsstageContext,
    map: &impl GuestPhysicalMap,
    swtlb: &NestedSwTlb<A, ITLB, DTLB>,
    access: Access,
    sepc: u64,
    gva: u64,
) -> core::result::Result<Page, Trap> {
    if vctx.mode == Stage1Mode::Off {
        return gstage_translate(gctx, map, swtlb, access, sepc, gva);
    }
    let (gpa, size, _flags) = walk_guest_stage1(gctx, vctx, map, swtlb, sepc, access, gva)?;
    let base_gva = gva & !(size - 1);
    let base_gpa = gpa & !(size - 1);
    let host = gstage_translate(gctx, map, swtlb, access, sepc, base_gpa)?;
    Ok(Page {
        ia: gva,
        oa: host.oa | (gva & (size - 1)),
        sz: size,
        flags: host.flags,
    })
}

/// Convert a raw guest/nested Stage-2 page fault (`scause`/`stval`/`htval`
/// from hardware) into a [`Trap`] ready for injection, mirroring
/// `cpu_vcpu_nested_page_fault`'s htval/htinst passthrough.
pub fn handle_guest_page_fault(sepc: u64, scause: u64, stval: u64, htval: u64, htinst: u64) -> Trap {
    log::debug!("nested walker: guest page fault scause={scause:#x} stval={stval:#x} htval={htval:#x}");
    Trap {
        sepc,
        scause,
        stval,
        htval,
        htinst,
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::arch::Stage;
    use crate::pgtbl::{FramePool, PageTable};
    use crate::testutil::FakeMmu;
    use alloc::collections::BTreeMap;
    use alloc::sync::Arc;
    use spin::Mutex;

    /// A trivial guest-physical-address space: host physical == guest
    /// physical (RAM everywhere), backed by a plain byte map so tests can
    /// plant raw page-table entries for the guest-owned Stage-2 walk.
    struct FlatMap {
        mem: Mutex<BTreeMap<u64, u64>>,
    }

    impl FlatMap {
        fn new() -> Self {
            FlatMap { mem: Mutex::new(BTreeMap::new()) }
        }

        fn poke(&self, pa: u64, val: u64) {
            self.mem.lock().insert(pa, val);
        }
    }

    impl GuestPhysicalMap for FlatMap {
        fn guest_physical_map(&self, gpa: u64, size: u64) -> Result<(u64, u64, RegionFlags)> {
            Ok((gpa, size, RegionFlags::NORMAL))
        }

        fn read_host_u64(&self, host_pa: u64) -> Result<u64> {
            Ok(*self.mem.lock().get(&host_pa).unwrap_or(&0))
        }
    }

    fn shadow_table() -> Arc<PageTable<FakeMmu>> {
        let pool = Arc::new(FramePool::new(64, FakeMmu::PGTBL_ENTRIES));
        Arc::new(PageTable::new(pool, Stage::Stage2))
    }

    #[test]
    fn nostage_identity_mode_passes_region_through() {
        let map = FlatMap::new();
        let page = nostage_translate::<FakeMmu>(&map, Access::Read, 0x8000_1000).unwrap();
        assert_eq!(page.oa, 0x8000_1000);
        assert_eq!(page.sz, 0x1000);
    }

    #[test]
    fn nostage_write_to_rom_only_region_faults() {
        struct RomMap;
        impl GuestPhysicalMap for RomMap {
            fn guest_physical_map(&self, gpa: u64, size: u64) -> Result<(u64, u64, RegionFlags)> {
                Ok((gpa, size, RegionFlags::READ | RegionFlags::IS_ROM))
            }
            fn read_host_u64(&self, _: u64) -> Result<u64> {
                Ok(0)
            }
        }
        let map = RomMap;
        assert!(nostage_translate::<FakeMmu>(&map, Access::Read, 0x1000).is_ok());
        assert!(nostage_translate::<FakeMmu>(&map, Access::Write, 0x1000).is_err());
    }

    #[test]
    fn gstage_off_mode_is_identity_through_nostage() {
        let map = FlatMap::new();
        let swtlb: NestedSwTlb<FakeMmu, 4, 4> = NestedSwTlb::new(shadow_table());
        let ctx = GstageContext { mode: Stage2Mode::Off, root_gpa: 0, vmid: 0 };
        let page = gstage_translate(&ctx, &map, &swtlb, Access::Read, 0, 0x8000_2000).unwrap();
        assert_eq!(page.oa, 0x8000_2000);
    }

    #[test]
    fn gstage_store_without_write_pte_redirects_guest_page_fault() {
        let map = FlatMap::new();
        let swtlb: NestedSwTlb<FakeMmu, 4, 4> = NestedSwTlb::new(shadow_table());
        // Single-level (leaf-at-root) fake Stage-2 table: PTE for index 0
        // maps gpa 0x0 read-only (`FakeMmu` packs a leaf PTE as
        // `1 | flags.bits() << 1 | (ppn << 10)`, so `pte & 0xe != 0` is what
        // distinguishes a leaf from an all-zero-flags table pointer).
        use crate::arch::PageFlags;
        let root = 0x9000_0000u64;
        let pte = 1 | ((PageFlags::VALID | PageFlags::READ).bits() as u64) << 1;
        map.poke(root, pte);
        let ctx = GstageContext { mode: Stage2Mode::Sv39x4, root_gpa: root, vmid: 0 };
        let err = gstage_translate(&ctx, &map, &swtlb, Access::Write, 0x42, 0x0).unwrap_err();
        assert_eq!(err.htval, 0x0 >> 2);
        assert_eq!(err.scause, cause::STORE_GUEST_PAGE_FAULT);
    }
}
