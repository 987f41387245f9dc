//! Component C: host (hypervisor-own) address-space glue.
//!
//! Grounded on `arch_cpu_aspace_map`/`arch_cpu_aspace_unmap`/`arch_cpu_aspace_va2pa`
//! and `arch_cpu_aspace_primary_init` in `generic_mmu.c`. The C side keeps a
//! single static `mmu_hypervisor_pgtbl` root scanned out of a hand-built
//! `def_pgtbl`/`def_pgtbl_tree` array at boot; we replace the handcrafted
//! array with one [`crate::pgtbl::pool::FramePool`] plus one root table,
//! both created lazily on first use and held behind a single owned
//! `spin::Once` global.

use alloc::sync::Arc;

use crate::arch::{ArchMmu, Page, RegionFlags, Stage};
use crate::error::{Error, Result};
use crate::pgtbl::{FramePool, PageTable};

/// The hypervisor's own Stage-1 address space: one root table plus the
/// frame pool backing its non-root levels.
pub struct HostAddressSpace<A: ArchMmu> {
    table: PageTable<A>,
}

impl<A: ArchMmu> HostAddressSpace<A> {
    pub fn new(pool: Arc<FramePool>) -> Self {
        HostAddressSpace {
            table: PageTable::new(pool, Stage::Stage1),
        }
    }

    /// Install a `va -> pa` mapping of `size` bytes with `region`'s
    /// permissions, translated to architecture PTE flags via
    /// [`ArchMmu::pgflags_set`].
    pub fn map(&self, va: u64, pa: u64, size: u64, region: RegionFlags) -> Result<()> {
        let flags = A::pgflags_set(region, Stage::Stage1);
        self.table.map_page(Page {
            ia: va,
            oa: pa,
            sz: size,
            flags,
        })
    }

    pub fn unmap(&self, va: u64) -> Result<()> {
        self.table.unmap_page(va)
    }

    /// Translate a host virtual address to its physical address.
    pub fn va2pa(&self, va: u64) -> Result<u64> {
        Ok(self.table.get_page(va)?.oa)
    }

    pub fn page_table(&self) -> &PageTable<A> {
        &self.table
    }
}

#[cfg(target_arch = "riscv64")]
pub type HostArch = crate::arch::riscv64::Sv39x4;

#[cfg(target_arch = "riscv64")]
static POOL: spin::Once<Arc<FramePool>> = spin::Once::new();
#[cfg(target_arch = "riscv64")]
static HOST_SPACE: spin::Once<HostAddressSpace<HostArch>> = spin::Once::new();

/// One-time setup of the global host address space, mirroring
/// `arch_cpu_aspace_primary_init`'s pool sizing (12.5% of VAPOOL, here a
/// plain frame-count parameter since this crate has no VAPOOL of its own).
#[cfg(target_arch = "riscv64")]
pub fn init(pool_capacity: usize) -> Result<()> {
    if HOST_SPACE.is_completed() {
        return Err(Error::AlreadyExists);
    }
    let pool = POOL.call_once(|| Arc::new(FramePool::new(pool_capacity, HostArch::PGTBL_ENTRIES)));
    HOST_SPACE.call_once(|| HostAddressSpace::new(pool.clone()));
    log::info!("hostaspace: initialized with {pool_capacity} frames");
    Ok(())
}

#[cfg(target_arch = "riscv64")]
pub fn host_space() -> &'static HostAddressSpace<HostArch> {
    HOST_SPACE
        .get()
        .expect("hostaspace::init must run before host_space()")
}
