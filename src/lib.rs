//! Nested memory-management core for a RISC-V H-extension hypervisor.
//!
//! This crate is the host-side library a VM-exit loop calls into on
//! guest and nested page faults and CSR traps: a generic Stage-1/Stage-2
//! page-table engine (A, B), the glue that installs the hypervisor's own
//! address space on top of it (C), a virtual TLB for emulated guest
//! Stage-1 translation (D), a software TLB and walker for the doubly
//! virtualized (nested) case (E, F), and the nested hypervisor CSR /
//! HFENCE / shared-memory protocol (G). It has no event loop, device
//! model, or scheduler of its own; those live in the binary that embeds
//! it (`src/main.rs`).
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod arch;
pub mod error;
pub mod hostaspace;
pub mod nested;
pub mod pgtbl;
pub mod vtlb;

#[cfg(test)]
mod testutil;

pub use error::{Error, Result};
