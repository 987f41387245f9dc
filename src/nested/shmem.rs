//! Component G: the guest-hypervisor shared-memory protocol.
//!
//! Grounded on the `SBI_NACL_SHMEM_*` layout and
//! `cpu_vcpu_nested_update_shmem` / `cpu_vcpu_nested_sync_csr` /
//! `cpu_vcpu_nested_sync_hfence` / `cpu_vcpu_nested_prep_sret` /
//! `cpu_vcpu_nested_autoswap` in `cpu_vcpu_nested.c`. This module owns
//! only the record format and the sync/drain/autoswap operations; the
//! SBI NACL call-number dispatch that maps a hypercall to "run
//! `prep_sret` now" lives in the binary's trap-handling loop, not here.
//!
//! The shared page itself is supplied by the caller as a plain `&mut
//! [u8]` — this crate does not assume how the guest's page ends up
//! mapped into host address space, only its byte layout.

use alloc::sync::Arc;

use crate::arch::ArchMmu;
use crate::nested::csr::{bits as csr_bits, AccessClass, HCsr, NestedCsrs};
use crate::nested::swtlb::NestedSwTlb;

/// CSRs mirrored through the shared page, in image/dirty-bitmap index
/// order. Matches `nested_sync_csrs[]` in the original source.
pub const NESTED_SYNC_CSRS: [HCsr; 25] = [
    HCsr::Hstatus,
    HCsr::Hedeleg,
    HCsr::Hideleg,
    HCsr::Hvip,
    HCsr::Hie,
    HCsr::Hip,
    HCsr::Hgeip,
    HCsr::Hgeie,
    HCsr::Hcounteren,
    HCsr::Htimedelta,
    HCsr::Htval,
    HCsr::Htinst,
    HCsr::Hgatp,
    HCsr::Henvcfg,
    HCsr::Hvictl,
    HCsr::Vsstatus,
    HCsr::Vsip,
    HCsr::Vsie,
    HCsr::Vstvec,
    HCsr::Vsscratch,
    HCsr::Vsepc,
    HCsr::Vscause,
    HCsr::Vstval,
    HCsr::Vsatp,
    HCsr::Vstimecmp,
];

const NUM_CSRS: usize = NESTED_SYNC_CSRS.len();
const HFENCE_QUEUE_LEN: usize = 32;
const SRET_GPR_COUNT: usize = 8;

const CSR_OFFSET: usize = 0;
const DBITMAP_OFFSET: usize = CSR_OFFSET + NUM_CSRS * 8;
const DBITMAP_BYTES: usize = (NUM_CSRS + 7) / 8;
const HFENCE_OFFSET: usize = DBITMAP_OFFSET + DBITMAP_BYTES.next_multiple_of(8);
const HFENCE_ENTRY_STRIDE: usize = 3 * 8;
const SRET_OFFSET: usize = HFENCE_OFFSET + HFENCE_QUEUE_LEN * HFENCE_ENTRY_STRIDE;
const AUTOSWAP_OFFSET: usize = SRET_OFFSET + SRET_GPR_COUNT * 8;

/// Minimum page size this layout must fit inside.
pub const MIN_PAGE_SIZE: usize = AUTOSWAP_OFFSET + 16;

const AUTOSWAP_HSTATUS: u64 = 1 << 0;

/// HFENCE queue entry `type` field enumeration, a fixed set of eight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HfenceType {
    Gvma,
    GvmaAll,
    GvmaVmid,
    GvmaVmidAll,
    Vvma,
    VvmaAll,
    VvmaAsid,
    VvmaAsidAll,
}

impl HfenceType {
    fn from_bits(v: u64) -> Option<HfenceType> {
        Some(match v {
            0 => HfenceType::Gvma,
            1 => HfenceType::GvmaAll,
            2 => HfenceType::GvmaVmid,
            3 => HfenceType::GvmaVmidAll,
            4 => HfenceType::Vvma,
            5 => HfenceType::VvmaAll,
            6 => HfenceType::VvmaAsid,
            7 => HfenceType::VvmaAsidAll,
            _ => return None,
        })
    }

    fn is_gvma(self) -> bool {
        matches!(self, HfenceType::Gvma | HfenceType::GvmaAll | HfenceType::GvmaVmid | HfenceType::GvmaVmidAll)
    }
}

const CTRL_PEND: u64 = 1 << 0;
const CTRL_TYPE_SHIFT: u32 = 1;
const CTRL_TYPE_MASK: u64 = 0x7 << CTRL_TYPE_SHIFT;
const CTRL_ORDER_SHIFT: u32 = 4;
const CTRL_ORDER_MASK: u64 = 0x3F << CTRL_ORDER_SHIFT;
const CTRL_ID_SHIFT: u32 = 10;
const CTRL_ID_MASK: u64 = 0xFFFF << CTRL_ID_SHIFT;

struct HfenceEntry {
    kind: HfenceType,
    vmid_or_asid: u64,
    addr: u64,
    count: u64,
}

/// Typed view over a guest-supplied shared page implementing the
/// CSR-image / dirty-bitmap / HFENCE-queue / SRET-scratch / autoswap
/// record layout.
pub struct SharedMemory<'a> {
    page: &'a mut [u8],
}

impl<'a> SharedMemory<'a> {
    pub fn new(page: &'a mut [u8]) -> Option<Self> {
        if page.len() < MIN_PAGE_SIZE {
            return None;
        }
        Some(SharedMemory { page })
    }

    fn read_u64(&self, off: usize) -> u64 {
        let bytes: [u8; 8] = self.page[off..off + 8].try_into().unwrap();
        u64::from_le_bytes(bytes)
    }

    fn write_u64(&mut self, off: usize, val: u64) {
        self.page[off..off + 8].copy_from_slice(&val.to_le_bytes());
    }

    fn is_dirty(&self, idx: usize) -> bool {
        let byte = self.page[DBITMAP_OFFSET + idx / 8];
        byte & (1 << (idx % 8)) != 0
    }

    fn clear_dirty(&mut self, idx: usize) {
        self.page[DBITMAP_OFFSET + idx / 8] &= !(1 << (idx % 8));
    }

    fn csr_image(&self, idx: usize) -> u64 {
        self.read_u64(CSR_OFFSET + idx * 8)
    }

    /// Copy `value` into the shared CSR image for `csr` and clear its
    /// dirty bit, mirroring the write-back `hext_csr_rmw` performs on
    /// every nested-CSR write (`cpu_vcpu_nested_update_shmem`).
    pub fn update_shmem(&mut self, csr: HCsr, value: u64) {
        if let Some(idx) = NESTED_SYNC_CSRS.iter().position(|&c| c == csr) {
            self.write_u64(CSR_OFFSET + idx * 8, value);
            self.clear_dirty(idx);
        }
    }

    /// Whether the shared copy of `csr` has been written by the guest
    /// since the last sync.
    pub fn check_shmem(&self, csr: HCsr) -> bool {
        NESTED_SYNC_CSRS.iter().position(|&c| c == csr).map(|idx| self.is_dirty(idx)).unwrap_or(false)
    }

    /// Copy every dirty shared CSR into `state`, applying the same
    /// write-mask/mode-nuke/swtlb-nuke rules `hext_csr_rmw` would, then
    /// clear its dirty bit (`cpu_vcpu_nested_sync_csr`, full sweep).
    /// `priv_check` is implicitly bypassed, matching the original.
    pub fn sync_csr<A: ArchMmu, const ITLB: usize, const DTLB: usize>(
        &mut self,
        state: &mut NestedCsrs,
        swtlb: &Arc<NestedSwTlb<A, ITLB, DTLB>>,
        timer: &mut impl crate::nested::csr::VsTimer,
    ) {
        let mut synced = 0;
        for (idx, &csr) in NESTED_SYNC_CSRS.iter().enumerate() {
            if !self.is_dirty(idx) {
                continue;
            }
            let value = self.csr_image(idx);
            crate::nested::csr::hext_csr_rmw(state, swtlb, timer, AccessClass::VirtualHs, csr, value, u64::MAX);
            self.clear_dirty(idx);
            synced += 1;
        }
        if synced > 0 {
            log::trace!("nested shmem: sync_csr synced {synced} dirty csrs");
        }
    }

    fn hfence_entry(&self, i: usize) -> Option<HfenceEntry> {
        let base = HFENCE_OFFSET + i * HFENCE_ENTRY_STRIDE;
        let ctrl = self.read_u64(base);
        if ctrl & CTRL_PEND == 0 {
            return None;
        }
        let kind = HfenceType::from_bits((ctrl & CTRL_TYPE_MASK) >> CTRL_TYPE_SHIFT)?;
        let order = (ctrl & CTRL_ORDER_MASK) >> CTRL_ORDER_SHIFT;
        let id = (ctrl & CTRL_ID_MASK) >> CTRL_ID_SHIFT;
        let page_number = self.read_u64(base + 8);
        let page_count = self.read_u64(base + 16);
        Some(HfenceEntry {
            kind,
            vmid_or_asid: id,
            addr: page_number << order,
            count: page_count,
        })
    }

    fn clear_hfence_entry(&mut self, i: usize) {
        let base = HFENCE_OFFSET + i * HFENCE_ENTRY_STRIDE;
        self.write_u64(base, 0);
    }

    /// Drain the HFENCE queue: each pending descriptor requests discarding
    /// certain cached translations, either directly (`hfence.vvma`) or by
    /// evicting the nested software TLB (`hfence.gvma`, since that cache
    /// is this crate's model of the hardware G-stage TLB). GVMA entries
    /// naming a VMID other than the guest's current `hgatp.VMID` are
    /// dropped without effect — they name a different nested guest.
    pub fn sync_hfence<A: ArchMmu, const ITLB: usize, const DTLB: usize>(
        &mut self,
        state: &NestedCsrs,
        swtlb: &NestedSwTlb<A, ITLB, DTLB>,
    ) {
        let current_vmid = (state.hgatp & csr_bits::HGATP_VMID_MASK) >> csr_bits::HGATP_VMID_SHIFT;
        for i in 0..HFENCE_QUEUE_LEN {
            let Some(entry) = self.hfence_entry(i) else { continue };
            if entry.kind.is_gvma() {
                let vmid_matches = matches!(entry.kind, HfenceType::Gvma | HfenceType::GvmaAll)
                    || entry.vmid_or_asid == current_vmid;
                if vmid_matches {
                    match entry.kind {
                        HfenceType::GvmaAll | HfenceType::GvmaVmidAll => swtlb.flush(0, 0),
                        _ => swtlb.flush(entry.addr, (entry.count.max(1)) << 12),
                    }
                    log::trace!("nested shmem: hfence {:?} applied addr={:#x}", entry.kind, entry.addr);
                } else {
                    log::trace!(
                        "nested shmem: hfence {:?} dropped, vmid {} != current {current_vmid}",
                        entry.kind,
                        entry.vmid_or_asid
                    );
                }
            } else {
                match entry.kind {
                    HfenceType::Vvma => A::hfence_vvma_va(entry.addr),
                    HfenceType::VvmaAll => A::hfence_vvma_all(),
                    HfenceType::VvmaAsid => A::hfence_vvma_asid_va(entry.addr, entry.vmid_or_asid),
                    HfenceType::VvmaAsidAll => A::hfence_vvma_asid(entry.vmid_or_asid),
                    _ => unreachable!(),
                }
            }
            self.clear_hfence_entry(i);
        }
    }

    fn read_sret_gpr(&self, i: usize) -> u64 {
        self.read_u64(SRET_OFFSET + i * 8)
    }

    /// Restore the GPR scratch area the guest populated before SRET into
    /// `gprs` (indices beyond `gprs.len()` or [`SRET_GPR_COUNT`] are
    /// ignored).
    pub fn restore_sret_gprs(&self, gprs: &mut [u64]) {
        for (i, slot) in gprs.iter_mut().enumerate().take(SRET_GPR_COUNT) {
            *slot = self.read_sret_gpr(i);
        }
    }

    fn autoswap_flags(&self) -> u64 {
        self.read_u64(AUTOSWAP_OFFSET)
    }

    /// If the guest requested an `hstatus` autoswap, exchange the
    /// emulated `hstatus` with the value staged in the autoswap slot,
    /// writing the previous value back so the guest can later restore it.
    pub fn autoswap(&mut self, state: &mut NestedCsrs) {
        if self.autoswap_flags() & AUTOSWAP_HSTATUS == 0 {
            return;
        }
        let staged = self.read_u64(AUTOSWAP_OFFSET + 8);
        let previous = state.hstatus;
        state.hstatus = staged;
        self.write_u64(AUTOSWAP_OFFSET + 8, previous);
        log::trace!("nested shmem: autoswap hstatus {previous:#x} -> {staged:#x}");
    }

    /// `cpu_vcpu_nested_prep_sret`: sync dirty CSRs, drain HFENCEs,
    /// restore the SRET GPR scratch, then run the autoswap — in that
    /// order, matching the original's sequencing (a dirty `hgatp` must
    /// take effect before any queued GVMA entry is evaluated against it).
    pub fn prep_sret<A: ArchMmu, const ITLB: usize, const DTLB: usize>(
        &mut self,
        state: &mut NestedCsrs,
        swtlb: &Arc<NestedSwTlb<A, ITLB, DTLB>>,
        timer: &mut impl crate::nested::csr::VsTimer,
        gprs: &mut [u64],
    ) {
        self.sync_csr(state, swtlb, timer);
        self.sync_hfence(state, swtlb);
        self.restore_sret_gprs(gprs);
        self.autoswap(state);
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use crate::testutil::FakeMmu;
    use crate::arch::Stage;
    use crate::nested::csr::VsTimer;
    use crate::pgtbl::{FramePool, PageTable};

    struct NoopTimer;
    impl VsTimer for NoopTimer {
        fn vs_irq(&self) -> bool {
            false
        }
        fn vs_cycle(&self) -> u64 {
            0
        }
        fn vs_start(&mut self, _: u64) {}
        fn vs_restart(&mut self) {}
    }

    fn swtlb() -> Arc<NestedSwTlb<FakeMmu, 4, 4>> {
        let pool = Arc::new(FramePool::new(16, FakeMmu::PGTBL_ENTRIES));
        let shadow = Arc::new(PageTable::new(pool, Stage::Stage2));
        Arc::new(NestedSwTlb::new(shadow))
    }

    #[test]
    fn autoswap_on_sret_exchanges_hstatus() {
        let mut backing = alloc::vec![0u8; MIN_PAGE_SIZE];
        let mut shmem = SharedMemory::new(&mut backing).unwrap();
        shmem.write_u64(AUTOSWAP_OFFSET, AUTOSWAP_HSTATUS);
        shmem.write_u64(AUTOSWAP_OFFSET + 8, 0xDEAD_BEEF);

        let mut state = NestedCsrs::new();
        state.hstatus = 0x1111_1111;
        let swtlb = swtlb();
        let mut timer = NoopTimer;
        let mut gprs = [0u64; SRET_GPR_COUNT];
        shmem.prep_sret(&mut state, &swtlb, &mut timer, &mut gprs);

        assert_eq!(state.hstatus, 0xDEAD_BEEF);
        assert_eq!(shmem.read_u64(AUTOSWAP_OFFSET + 8), 0x1111_1111);
    }

    #[test]
    fn dirty_csr_syncs_then_sync_csr_is_idempotent() {
        let mut backing = alloc::vec![0u8; MIN_PAGE_SIZE];
        let mut shmem = SharedMemory::new(&mut backing).unwrap();
        let idx = NESTED_SYNC_CSRS.iter().position(|&c| c == HCsr::Hedeleg).unwrap();
        shmem.write_u64(CSR_OFFSET + idx * 8, 0x55);
        shmem.page[DBITMAP_OFFSET + idx / 8] |= 1 << (idx % 8);

        let mut state = NestedCsrs::new();
        let swtlb = swtlb();
        let mut timer = NoopTimer;
        shmem.sync_csr(&mut state, &swtlb, &mut timer);
        assert_eq!(state.hedeleg, 0x55);
        assert!(!shmem.is_dirty(idx));

        // Bitmap already clean: a second sync is a no-op.
        state.hedeleg = 0x99;
        shmem.sync_csr(&mut state, &swtlb, &mut timer);
        assert_eq!(state.hedeleg, 0x99);
    }

    #[test]
    fn gvma_vmid_mismatch_then_match() {
        use crate::arch::{Page, PageFlags, RegionFlags};
        use crate::nested::walker::Access;

        let mut backing = alloc::vec![0u8; MIN_PAGE_SIZE];
        let mut shmem = SharedMemory::new(&mut backing).unwrap();
        let mut state = NestedCsrs::new();
        state.hgatp = 5 << csr_bits::HGATP_VMID_SHIFT;
        let swtlb = swtlb();

        let p = Page { ia: 0x10, oa: 0x1000, sz: 0x1000, flags: PageFlags::VALID | PageFlags::READ };
        swtlb.update(Access::Read, 0, p, p, RegionFlags::NORMAL).unwrap();
        assert_eq!(swtlb.mapped_count(), 1);

        let ctrl = CTRL_PEND | (2u64 << CTRL_TYPE_SHIFT) | (7u64 << CTRL_ID_SHIFT);
        shmem.write_u64(HFENCE_OFFSET, ctrl);
        shmem.write_u64(HFENCE_OFFSET + 8, 0);
        shmem.write_u64(HFENCE_OFFSET + 16, 1);
        shmem.sync_hfence(&state, &swtlb);
        assert_eq!(swtlb.mapped_count(), 1, "VMID mismatch must not evict");

        state.hgatp = 7 << csr_bits::HGATP_VMID_SHIFT;
        shmem.write_u64(HFENCE_OFFSET, ctrl);
        shmem.sync_hfence(&state, &swtlb);
        assert_eq!(swtlb.mapped_count(), 0, "matching VMID must evict");
    }
}
