//! Components E, F, G: the nested (doubly-virtualized) translation and
//! CSR-emulation core, grounded on `cpu_vcpu_nested.c`.

pub mod csr;
pub mod shmem;
pub mod swtlb;
pub mod walker;

pub use csr::{hext_csr_rmw, smode_csr_rmw, CsrOutcome, NestedCsrs, VsTimer};
pub use shmem::SharedMemory;
pub use swtlb::NestedSwTlb;
pub use walker::{
    gstage_translate, nostage_translate, vsstage_translate, Access, GstageContext, GuestPhysicalMap, Stage1Mode,
    Stage2Mode, Trap, VsstageContext,
};
