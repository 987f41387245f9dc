#![cfg_attr(feature = "axstd", no_std)]
#![cfg_attr(feature = "axstd", no_main)]
#![cfg_attr(feature = "axstd", feature(riscv_ext_intrinsics))]

#[cfg(feature = "axstd")]
extern crate axstd as std;

#[cfg(feature = "axstd")]
extern crate alloc;

#[cfg(feature = "axstd")]
#[macro_use]
extern crate axlog;

#[cfg(feature = "axstd")]
extern crate axfs;
#[cfg(feature = "axstd")]
extern crate axio;

// ────────────────── Supporting modules ──────────────────
// The guest world switch, register layout, SBI decoding and image loading
// are this binary's own concerns (it is the VM-exit loop, not the nested
// MMU core); the nested/guest page-fault path below calls into
// `nested_mmu_core` itself.
#[cfg(feature = "axstd")]
mod vcpu;
#[cfg(feature = "axstd")]
mod regs;
#[cfg(feature = "axstd")]
mod sbi;
#[cfg(feature = "axstd")]
mod loader;

// VM entry point (guest physical / intermediate-physical address).
#[cfg(feature = "axstd")]
const VM_ENTRY: usize = 0x8020_0000;

// ════════════════════════════════════════════════════════════════
//  Entry point
// ════════════════════════════════════════════════════════════════

#[cfg_attr(feature = "axstd", unsafe(no_mangle))]
fn main() {
    #[cfg(feature = "axstd")]
    riscv64_main();

    #[cfg(not(feature = "axstd"))]
    {
        println!("This application requires the 'axstd' feature for running the Hypervisor.");
        println!("Run with: cargo xtask run");
    }
}

// ════════════════════════════════════════════════════════════════
//  RISC-V 64  (H-extension hypervisor)
// ════════════════════════════════════════════════════════════════

#[cfg(feature = "axstd")]
fn riscv64_main() {
    use axhal::mem::PhysAddr;
    use axhal::paging::MappingFlags;
    use memory_addr::va;
    use nested_mmu_core::nested::csr::bits as hstatus_bits;
    use regs::VmCpuRegisters;
    use sbi::SbiMessage;
    use loader::load_vm_image;

    ax_println!("Hypervisor ...");

    // ── 1. Create large address space (0x0 .. 0x7fff_ffff_f000) ──
    let mut uspace = axmm::AddrSpace::new_empty(va!(0x0), 0x7fff_ffff_f000).unwrap();

    // Copy kernel page table entries so kernel code is accessible.
    uspace
        .copy_mappings_from(&axmm::kernel_aspace().lock())
        .unwrap();

    // ── 2. Load guest binary from disk ──
    if let Err(e) = load_vm_image("/sbin/gkernel", &mut uspace, VM_ENTRY) {
        panic!("Cannot load app! {:?}", e);
    }

    // ── 3. Setup guest context ──
    let mut ctx = VmCpuRegisters::default();
    prepare_guest_context(&mut ctx);

    // ── 4. Setup second-stage page table ──
    let ept_root = uspace.page_table_root();
    prepare_vm_pgtable(ept_root);

    // ── 5. Run guest in loop ──
    ax_println!("Entering VM run loop...");
    loop {
        vcpu::run_guest(&mut ctx);

        let scause: usize;
        let stval: usize;
        let htval: usize;
        let htinst: usize;
        unsafe {
            core::arch::asm!("csrr {}, scause", out(reg) scause);
            core::arch::asm!("csrr {}, stval", out(reg) stval);
            core::arch::asm!("csrr {}, htval", out(reg) htval);
            core::arch::asm!("csrr {}, htinst", out(reg) htinst);
        }
        ctx.trap_csrs = regs::TrapCsrs { scause, stval, htval, htinst };

        if scause == 10 {
            // VirtualSupervisorEnvCall — parse SBI message.
            let sbi_msg = SbiMessage::from_regs(ctx.guest_regs.gprs.a_regs());
            if let Some(msg) = sbi_msg {
                match msg {
                    SbiMessage::Reset(_) => {
                        ax_println!("VmExit Reason: VSuperEcall: Reset");
                        ax_println!("Shutdown vm normally!");
                        break;
                    }
                }
            } else {
                // Unknown SBI call: advance guest PC by 4 and retry.
                ctx.guest_regs.sepc += 4;
            }
        } else if scause == 21 || scause == 23 {
            // LoadGuestPageFault (21) / StoreGuestPageFault (23) —
            // Nested Page Fault handling. This demo runs one guest
            // directly atop the host (one level of translation); the
            // doubly-virtualized (nested-inside-nested) walker in
            // `nested_mmu_core::nested` is what a guest hypervisor running
            // atop this one would drive through the CSR/shared-memory
            // protocol in `nested::csr`/`nested::shmem`, not this loop.
            let fault_addr = (htval << 2) | (stval & 0x3);
            log::debug!("nested page fault addr={fault_addr:#x}");

            // Map the faulting page with passthrough (GPA -> HPA identity).
            let flags = MappingFlags::READ | MappingFlags::WRITE
                | MappingFlags::EXECUTE | MappingFlags::USER;
            let _ = uspace.map_linear(
                fault_addr.into(),
                PhysAddr::from(fault_addr),
                4096,
                flags,
            );

            // Flush guest TLB.
            unsafe {
                core::arch::riscv64::hfence_gvma_all();
            }
        } else {
            panic!(
                "Unhandled trap: scause={scause:#x}, sepc: {:#x}, stval: {stval:#x}",
                ctx.guest_regs.sepc,
            );
        }
    }

    panic!("Hypervisor ok!");

    fn prepare_vm_pgtable(ept_root: PhysAddr) {
        let hgatp = 8usize << 60 | usize::from(ept_root) >> 12;
        unsafe {
            core::arch::asm!(
                "csrw hgatp, {hgatp}",
                hgatp = in(reg) hgatp,
            );
            core::arch::riscv64::hfence_gvma_all();
        }
    }

    fn prepare_guest_context(ctx: &mut VmCpuRegisters) {
        let hstatus_val: usize;
        unsafe {
            core::arch::asm!("csrr {}, hstatus", out(reg) hstatus_val);
        }
        let mut hstatus = hstatus_val as u64;
        hstatus |= hstatus_bits::HSTATUS_SPV;
        hstatus &= !hstatus_bits::HSTATUS_SPVP;
        unsafe {
            core::arch::asm!("csrw hstatus, {hstatus}", hstatus = in(reg) hstatus as usize);
        }
        ctx.guest_regs.hstatus = hstatus as usize;

        unsafe {
            riscv::register::sstatus::set_spp(riscv::register::sstatus::SPP::Supervisor);
        }
        let sstatus_val: usize;
        unsafe {
            core::arch::asm!("csrr {}, sstatus", out(reg) sstatus_val);
        }
        ctx.guest_regs.sstatus = sstatus_val;
        ctx.guest_regs.sepc = VM_ENTRY;
    }
}
