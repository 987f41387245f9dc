//! The host<->guest world switch.
//!
//! Grounded on the `VCpu::run` trampoline in the
//! `nuta-hypervisor-in-1000-lines` reference: stash the CSRs that pick the
//! guest's privilege/virtualization mode and `sret` into VS-mode. We
//! extend it to actually save/restore the host's callee-saved GPRs around
//! the trip (the 1000-line reference gets away without this because it
//! never returns to its caller), matching the host-context-save shape
//! `cpu_vcpu_nested.c`'s callers expect from a VM-entry primitive. Field
//! offsets are resolved with `core::mem::offset_of!` rather than hand-kept
//! constants, so a layout change to [`crate::regs`] can't silently
//! desynchronize this asm.

use core::arch::asm;
use core::mem::offset_of;

use crate::regs::{GprRegs, GuestRegs, VmCpuRegisters};

/// Enter the guest described by `regs`, returning once it traps back to
/// the host. On return, `regs.guest_regs` holds the GPR and entry-CSR
/// state the guest had at the moment of the trap; `regs.trap_csrs` is
/// populated separately by the caller from `scause`/`stval`/`htval`/
/// `htinst` right after this returns, since those are latched straight
/// from hardware rather than saved by this trampoline.
pub fn run_guest(regs: &mut VmCpuRegisters) {
    const GR: usize = offset_of!(VmCpuRegisters, guest_regs);
    const SEPC: usize = GR + offset_of!(GuestRegs, sepc);
    const SSTATUS: usize = GR + offset_of!(GuestRegs, sstatus);
    const HSTATUS: usize = GR + offset_of!(GuestRegs, hstatus);
    const GPRS: usize = GR + offset_of!(GuestRegs, gprs);
    const HOST_SP: usize = offset_of!(VmCpuRegisters, host_sp);
    const HOST_RA: usize = offset_of!(VmCpuRegisters, host_ra);

    unsafe {
        asm!(
            // Remember where the host's stack and resume point are so a
            // guest trap can get back here without unwinding through a
            // call stack the trap itself bypassed.
            "sd sp, {host_sp}(a0)",
            "la t0, 3f",
            "sd t0, {host_ra}(a0)",
            "ld t0, {sepc}(a0)",
            "csrw sepc, t0",
            "ld t0, {sstatus}(a0)",
            "csrw sstatus, t0",
            "ld t0, {hstatus}(a0)",
            "csrw hstatus, t0",
            // Point sscratch at `regs` so the trap entry can find it again,
            // then load every guest GPR from `gprs` and enter VS-mode.
            "csrw sscratch, a0",
            "addi t1, a0, {gprs}",
            "ld ra,   {ra}(t1)",
            "ld sp,   {sp}(t1)",
            "ld gp,   {gp}(t1)",
            "ld tp,   {tp}(t1)",
            "ld t3,   {t3}(t1)",
            "ld t4,   {t4}(t1)",
            "ld t5,   {t5}(t1)",
            "ld t6,   {t6}(t1)",
            "ld s0,   {s0}(t1)",
            "ld s1,   {s1}(t1)",
            "ld s2,   {s2}(t1)",
            "ld s3,   {s3}(t1)",
            "ld s4,   {s4}(t1)",
            "ld s5,   {s5}(t1)",
            "ld s6,   {s6}(t1)",
            "ld s7,   {s7}(t1)",
            "ld s8,   {s8}(t1)",
            "ld s9,   {s9}(t1)",
            "ld s10,  {s10}(t1)",
            "ld s11,  {s11}(t1)",
            "ld a1,   {a1}(t1)",
            "ld a2,   {a2}(t1)",
            "ld a3,   {a3}(t1)",
            "ld a4,   {a4}(t1)",
            "ld a5,   {a5}(t1)",
            "ld a6,   {a6}(t1)",
            "ld a7,   {a7}(t1)",
            "ld a0,   {a0}(t1)",
            "sret",
            "3:",
            // `_guest_trap_entry` (installed as `stvec` by the caller)
            // reloads the host stack and jumps to `host_ra`, landing here;
            // the asm! clobber list below tells the compiler every one of
            // these registers is garbage on return, same as a real call.
            host_sp = const HOST_SP,
            host_ra = const HOST_RA,
            sepc = const SEPC,
            sstatus = const SSTATUS,
            hstatus = const HSTATUS,
            gprs = const GPRS,
            ra = const offset_of!(GprRegs, ra),
            sp = const offset_of!(GprRegs, sp),
            gp = const offset_of!(GprRegs, gp),
            tp = const offset_of!(GprRegs, tp),
            t3 = const offset_of!(GprRegs, t3),
            t4 = const offset_of!(GprRegs, t4),
            t5 = const offset_of!(GprRegs, t5),
            t6 = const offset_of!(GprRegs, t6),
            s0 = const offset_of!(GprRegs, s0),
            s1 = const offset_of!(GprRegs, s1),
            s2 = const offset_of!(GprRegs, s2),
            s3 = const offset_of!(GprRegs, s3),
            s4 = const offset_of!(GprRegs, s4),
            s5 = const offset_of!(GprRegs, s5),
            s6 = const offset_of!(GprRegs, s6),
            s7 = const offset_of!(GprRegs, s7),
            s8 = const offset_of!(GprRegs, s8),
            s9 = const offset_of!(GprRegs, s9),
            s10 = const offset_of!(GprRegs, s10),
            s11 = const offset_of!(GprRegs, s11),
            a0 = const offset_of!(GprRegs, a0),
            a1 = const offset_of!(GprRegs, a1),
            a2 = const offset_of!(GprRegs, a2),
            a3 = const offset_of!(GprRegs, a3),
            a4 = const offset_of!(GprRegs, a4),
            a5 = const offset_of!(GprRegs, a5),
            a6 = const offset_of!(GprRegs, a6),
            a7 = const offset_of!(GprRegs, a7),
            inout("a0") core::ptr::from_mut(regs) => _,
            out("t0") _, out("t1") _,
            out("t2") _, out("t3") _, out("t4") _, out("t5") _, out("t6") _,
            out("ra") _,
            out("s0") _, out("s1") _, out("s2") _, out("s3") _, out("s4") _,
            out("s5") _, out("s6") _, out("s7") _, out("s8") _, out("s9") _,
            out("s10") _, out("s11") _,
            out("a1") _, out("a2") _, out("a3") _, out("a4") _,
            out("a5") _, out("a6") _, out("a7") _,
        );
    }
}

// `global_asm!` can't reach `offset_of!`, so the trap entry's copies of
// `host_sp`/`host_ra`'s offsets are plain literals; these assertions fail
// loudly at compile time if `VmCpuRegisters`'s layout ever drifts from them.
const _: () = assert!(offset_of!(VmCpuRegisters, host_sp) == 272);
const _: () = assert!(offset_of!(VmCpuRegisters, host_ra) == 280);

core::arch::global_asm!(
    r#"
.section .text
.global _guest_trap_entry
_guest_trap_entry:
    csrr a0, sscratch
    ld t0, 280(a0)
    ld sp, 272(a0)
    jr t0
"#
);
