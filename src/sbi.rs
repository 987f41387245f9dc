//! Minimal SBI call decoding for traps taken from VS-mode.
//!
//! The guest vCPU runs the real S-mode privilege level virtualized (the
//! H-extension handles this in hardware); an `ecall` from VS-mode still
//! traps to the host as a `VirtualSupervisorEnvCall`, same as a plain
//! `ecall` from S-mode traps to a non-nested hypervisor. We only decode
//! what the payload kernel in this workspace actually issues — the legacy
//! (EID `<= 0x0F`) shutdown call — rather than the full SBI surface;
//! `sbi-spec` already gives the extension IDs, this just recognizes them.

use sbi_spec::legacy::LEGACY_SHUTDOWN;

/// A decoded SBI call, split by what the host's VM-exit loop needs to do
/// about it rather than mirrored 1:1 off the wire format.
#[derive(Debug, Clone, Copy)]
pub enum SbiMessage {
    /// The legacy shutdown extension: the guest is done, tear the VM down.
    Reset(u64),
}

impl SbiMessage {
    /// Decode `a0..=a7` as latched at the `ecall` trap. Returns `None` for
    /// anything this host doesn't recognize; the caller advances `sepc`
    /// past the `ecall` and lets the guest retry or get stuck, matching
    /// how a non-nested SBI implementation would reject an unknown EID.
    pub fn from_regs(a: [u64; 8]) -> Option<SbiMessage> {
        let eid = a[7];
        if eid == LEGACY_SHUTDOWN as u64 {
            return Some(SbiMessage::Reset(a[0]));
        }
        None
    }
}
