//! Guest image loading: read a flat binary from the root filesystem and
//! map it linearly at the guest's physical entry address.
//!
//! The payload kernels in this workspace are built `no_std`/`no_main` flat
//! binaries (see `payload/gkernel`), not ELF — so "load" here is "copy
//! bytes and map them executable", not relocation or segment parsing.

use std::io::Read;
use std::fs::File;

use alloc::sync::Arc;

use axhal::paging::{MappingFlags, PageSize};
use axmm::backend::{Backend, SharedPages};
use axmm::AddrSpace;
use memory_addr::{PAGE_SIZE_4K, VirtAddr};

use nested_mmu_core::error::{Error, Result};

/// Read `path` in full and map it at `uspace`'s configured entry point,
/// rounded up to whole pages and backed by freshly allocated, zero-filled
/// guest memory (so a short image still gets a clean BSS tail).
pub fn load_vm_image(path: &str, uspace: &mut AddrSpace, entry: usize) -> Result<()> {
    let mut file = File::open(path).map_err(|_| Error::Io)?;
    let mut image = alloc::vec::Vec::new();
    file.read_to_end(&mut image).map_err(|_| Error::Io)?;

    let npages = image.len().div_ceil(PAGE_SIZE_4K);
    let size = npages * PAGE_SIZE_4K;
    let flags = MappingFlags::READ | MappingFlags::WRITE | MappingFlags::EXECUTE | MappingFlags::USER;
    let pages = Arc::new(SharedPages::new(size, PageSize::Size4K).map_err(|_| Error::NoMemory)?);
    uspace
        .map(
            VirtAddr::from(entry),
            size,
            flags,
            true,
            Backend::new_shared(VirtAddr::from(entry), pages),
        )
        .map_err(|_| Error::NoMemory)?;

    // SAFETY: the mapping above was just installed as RWX at `entry`,
    // sized to cover the whole image, and is not concurrently observed by
    // any other vCPU before the guest is first entered.
    unsafe {
        core::ptr::copy_nonoverlapping(image.as_ptr(), entry as *mut u8, image.len());
    }
    Ok(())
}
