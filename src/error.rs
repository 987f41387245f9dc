//! Unified error type for the nested memory-management core.
//!
//! Every public boundary in this crate returns `Result<T>`. There are no
//! text error messages in the contract: callers match on [`Error`] and, in
//! the nested walker's case, forward [`Error::Redirect`] into the virtual
//! hypervisor rather than treat it as failure.

use core::fmt;

use crate::nested::walker::Trap;

/// The unified error enumeration surfaced at every public boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Requested block size not legal, bad stage, null arguments, misaligned input.
    Invalid,
    /// Guest-physical access lands outside memory/ROM regions or violates region permissions.
    Fault,
    /// Page-table frame pool empty, or shared-memory allocation failed.
    NoMemory,
    /// Legal-looking request for a feature not enabled in this build.
    NotSupported,
    /// Shared-memory mapping to host failed.
    Io,
    /// Attach to a slot that already holds a valid entry; re-map of an existing page.
    AlreadyExists,
    /// Lookup reached a cleared descriptor; pgtbl find failed.
    NotFound,
    /// Not an error in the usual sense: the nested walker produced a trap
    /// that the caller must inject into the virtual hypervisor.
    Redirect(Trap),
}

pub type Result<T = ()> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Invalid => write!(f, "invalid argument"),
            Error::Fault => write!(f, "guest-physical access fault"),
            Error::NoMemory => write!(f, "out of page-table frames"),
            Error::NotSupported => write!(f, "feature not enabled in this build"),
            Error::Io => write!(f, "shared-memory mapping failed"),
            Error::AlreadyExists => write!(f, "mapping already exists"),
            Error::NotFound => write!(f, "mapping not found"),
            Error::Redirect(trap) => write!(f, "redirect to guest hypervisor: {trap:?}"),
        }
    }
}

impl From<axerrno::AxError> for Error {
    fn from(e: axerrno::AxError) -> Self {
        match e {
            axerrno::AxError::InvalidInput | axerrno::AxError::BadAddress => Error::Invalid,
            axerrno::AxError::NoMemory => Error::NoMemory,
            axerrno::AxError::Unsupported => Error::NotSupported,
            axerrno::AxError::Io => Error::Io,
            axerrno::AxError::AlreadyExists => Error::AlreadyExists,
            axerrno::AxError::NotFound => Error::NotFound,
            _ => Error::Fault,
        }
    }
}

impl From<Error> for axerrno::AxError {
    fn from(e: Error) -> Self {
        match e {
            Error::Invalid => axerrno::AxError::InvalidInput,
            Error::Fault => axerrno::AxError::BadAddress,
            Error::NoMemory => axerrno::AxError::NoMemory,
            Error::NotSupported => axerrno::AxError::Unsupported,
            Error::Io => axerrno::AxError::Io,
            Error::AlreadyExists => axerrno::AxError::AlreadyExists,
            Error::NotFound => axerrno::AxError::NotFound,
            Error::Redirect(_) => axerrno::AxError::BadState,
        }
    }
}
