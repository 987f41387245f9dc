//! Guest vCPU register state saved and restored across a `_run_guest` trip.
//!
//! Grounded on the save-area layout `cpu_vcpu_nested.c`'s callers pass
//! around (`arch_regs_t`/`vmm_user_regs`) and the flatter struct the
//! `nuta-hypervisor-in-1000-lines` reference keeps for the same purpose —
//! we split it the way that example's single struct doesn't, since our
//! trap path also needs the CSRs the hardware latched on exit.

/// General-purpose registers in RISC-V calling-convention order.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GprRegs {
    pub ra: u64,
    pub sp: u64,
    pub gp: u64,
    pub tp: u64,
    pub t0: u64,
    pub t1: u64,
    pub t2: u64,
    pub s0: u64,
    pub s1: u64,
    pub a0: u64,
    pub a1: u64,
    pub a2: u64,
    pub a3: u64,
    pub a4: u64,
    pub a5: u64,
    pub a6: u64,
    pub a7: u64,
    pub s2: u64,
    pub s3: u64,
    pub s4: u64,
    pub s5: u64,
    pub s6: u64,
    pub s7: u64,
    pub s8: u64,
    pub s9: u64,
    pub s10: u64,
    pub s11: u64,
    pub t3: u64,
    pub t4: u64,
    pub t5: u64,
    pub t6: u64,
}

impl GprRegs {
    /// `a0..=a7`, the SBI call-argument/return registers.
    pub fn a_regs(&self) -> [u64; 8] {
        [self.a0, self.a1, self.a2, self.a3, self.a4, self.a5, self.a6, self.a7]
    }
}

/// Guest-visible register state: GPRs plus the handful of CSRs that must
/// be switched on every entry/exit rather than left to hardware H-mode
/// shadowing.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct GuestRegs {
    pub gprs: GprRegs,
    pub sepc: usize,
    pub sstatus: usize,
    pub hstatus: usize,
}

/// CSRs latched by the trap the host observed on the most recent guest
/// exit; read once right after `_run_guest` returns, before anything else
/// can clobber them.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct TrapCsrs {
    pub scause: usize,
    pub stval: usize,
    pub htval: usize,
    pub htinst: usize,
}

/// Everything `_run_guest` needs on entry and leaves behind on exit.
#[derive(Debug, Default, Clone, Copy)]
#[repr(C)]
pub struct VmCpuRegisters {
    pub guest_regs: GuestRegs,
    /// Host `sp` at the moment of `sret`, so a guest trap can find its way
    /// back to the host stack before anything Rust-visible runs again.
    pub host_sp: usize,
    /// Host `ra` at the moment of `sret`: the trap entry jumps here
    /// directly rather than unwinding back through a call stack that the
    /// trap itself bypassed.
    pub host_ra: usize,
    pub trap_csrs: TrapCsrs,
}
