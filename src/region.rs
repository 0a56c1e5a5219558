use std::{io, ptr::NonNull};

use log::{debug, warn};

use crate::{
    config::Fallback,
    error::{Error, Result},
    kernel::PlatformMemory,
    utils::HUGE_PAGE_SIZE,
};

/// Where the memory of a [`Region`] comes from. Releasing it has to go
/// through the same mechanism that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backing {
    /// A mapping backed by 2 MiB pages.
    HugePages,
    /// Ordinary heap memory used because huge pages were not available.
    Heap,
}

/// A block of memory obtained from the kernel with a single request.
///
/// ```text
/// +-------------------------------------------------+
/// |                 Region (size bytes)             |
/// +-------------------------------------------------+
/// ^ start (aligned to 2 MiB for huge pages, 64 bytes for the heap)
/// ```
///
/// The region is owned by whoever acquired it until it is released. We
/// never split it, reuse it or keep a pointer to it after release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    /// Start direction of the Region returned by the kernel.
    pub start: NonNull<u8>,
    /// Size of the region. Always a multiple of [`HUGE_PAGE_SIZE`].
    pub size: usize,
    pub backing: Backing,
}

impl Region {
    /// Maps a new region of exactly `size` bytes, which must be a non zero
    /// multiple of [`HUGE_PAGE_SIZE`].
    ///
    /// If the kernel can't give us huge pages the `fallback` policy decides
    /// whether we use the heap or give up.
    pub(crate) unsafe fn map<P: PlatformMemory>(size: usize, fallback: Fallback) -> Result<Self> {
        debug_assert!(size != 0 && size % HUGE_PAGE_SIZE == 0);

        let source = match unsafe { P::request_huge_pages(size) } {
            Ok(start) => {
                debug!("mapped {size} bytes of huge pages at {:p}", start);
                return Ok(Self { start, size, backing: Backing::HugePages });
            }
            Err(source) => source,
        };

        match fallback {
            Fallback::Fail => Err(Error::HugePages { size, source }),
            Fallback::Heap => {
                warn!("huge pages unavailable ({source}), using {size} bytes of heap memory");

                let start = unsafe { P::request_heap(size) }.ok_or(Error::Heap { size })?;
                Ok(Self { start, size, backing: Backing::Heap })
            }
        }
    }

    /// Gives the memory back through the same mechanism that produced it.
    pub(crate) unsafe fn unmap<P: PlatformMemory>(self) -> io::Result<()> {
        match self.backing {
            Backing::HugePages => {
                debug!("unmapping {} bytes of huge pages at {:p}", self.size, self.start);
                unsafe { P::return_huge_pages(self.start, self.size) }
            }
            Backing::Heap => {
                unsafe { P::return_heap(self.start) };
                Ok(())
            }
        }
    }
}
