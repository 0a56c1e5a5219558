//! Errors reported by the handle based allocator and the setup hook.
//!
//! The raw pointer API never returns these: it reports failures with a null
//! pointer and aborts on a corrupted header.

use std::io;

use thiserror::Error;

use crate::table::Handle;

/// Allocator operation result
pub type Result<T> = std::result::Result<T, Error>;

/// Allocator errors
#[derive(Error, Debug)]
pub enum Error {
    #[error("huge page mapping of {size} bytes failed: {source}")]
    HugePages {
        size: usize,
        #[source]
        source: io::Error,
    },

    #[error("heap fallback allocation of {size} bytes failed")]
    Heap { size: usize },

    #[error("requested size {0} overflows the addressable range")]
    SizeOverflow(usize),

    #[error("handle {0:?} does not refer to a live region")]
    InvalidHandle(Handle),

    #[error("the handle table is full")]
    TableFull,

    #[error("corrupted region header at 0x{address:x}: size {size} is not 0 or a multiple of the huge page size")]
    CorruptHeader { address: usize, size: usize },

    #[error("huge page pool unavailable: {free} free of {total} reserved pages")]
    PoolUnavailable { free: usize, total: usize },

    #[error("the process token does not hold the lock memory privilege")]
    PrivilegeNotHeld,

    #[error("huge page setup failed: {0}")]
    Setup(#[from] io::Error),
}
