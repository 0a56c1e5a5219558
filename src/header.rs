use std::ptr::{self, NonNull};

use log::{error, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    kernel::{Kernel, PlatformMemory},
    region::{Backing, Region},
    utils::{ALIGNMENT, HEADER_SIZE, HUGE_PAGE_SIZE, align_down, align_offset, region_size},
};

/// Every region handed out by [`acquire`] carries its real size in the
/// first word, so [`release`] only needs the pointer.
///
/// ```text
/// +---------------------+ <------+ start
/// |  real size (usize)  |        |
/// +---------------------+        | -> Header (one cache line)
/// |       padding       |        |
/// +---------------------+ <------+ user pointer (64 aligned)
/// |       Content       |        |
/// |         ...         |        | -> Addressable content
/// |         ...         |        |
/// +---------------------+ <------+ start + real size
/// ```
///
/// A real size of 0 means the region came from the heap fallback. Any other
/// value is the length of the huge page mapping.
const HEAP_SENTINEL: usize = 0;

/// Acquires at least `size` usable bytes backed by huge pages, using the
/// default [`Config`].
///
/// Returns a pointer aligned to [`ALIGNMENT`] bytes or null if no memory
/// could be obtained.
///
/// # Safety
///
/// The memory is uninitialized. It must be released with [`release`].
pub unsafe fn acquire(size: usize) -> *mut u8 {
    unsafe { acquire_with(size, &Config::default()) }
}

/// Same as [`acquire`] with an explicit configuration.
///
/// # Safety
///
/// See [`acquire`].
pub unsafe fn acquire_with(size: usize, config: &Config) -> *mut u8 {
    unsafe { acquire_in::<Kernel>(size, config) }
}

/// Releases a pointer returned by [`acquire`]. Null pointers are ignored.
///
/// # Safety
///
/// `ptr` must be null or come from [`acquire`] / [`acquire_with`] and not
/// have been released yet. Releasing the same pointer twice is undefined
/// behaviour.
///
/// The process is aborted if the header in front of `ptr` does not hold a
/// valid region size, since that means the pointer was never ours or the
/// memory around it got corrupted.
pub unsafe fn release(ptr: *mut u8) {
    unsafe { release_in::<Kernel>(ptr) }
}

pub(crate) unsafe fn acquire_in<P: PlatformMemory>(size: usize, config: &Config) -> *mut u8 {
    let Some(real_size) = region_size(size) else {
        warn!("refusing to acquire {size} bytes: region size overflows");
        return ptr::null_mut();
    };

    let region = match unsafe { Region::map::<P>(real_size, config.fallback) } {
        Ok(region) => region,
        Err(e) => {
            warn!("acquire of {size} bytes failed: {e}");
            return ptr::null_mut();
        }
    };

    let header = match region.backing {
        Backing::HugePages => region.size,
        Backing::Heap => HEAP_SENTINEL,
    };

    unsafe {
        // Store the real size at the beginning of the region.
        region.start.cast::<usize>().write(header);

        // Skip the header and pad up to the next cache line.
        let first = region.start.as_ptr().add(HEADER_SIZE);
        first.add(align_offset(first as usize, ALIGNMENT))
    }
}

pub(crate) unsafe fn release_in<P: PlatformMemory>(ptr: *mut u8) {
    let Some(user) = NonNull::new(ptr) else {
        return;
    };

    unsafe {
        let start = region_start(user);
        let real_size = start.cast::<usize>().read();

        let backing = match check_header(start.as_ptr() as usize, real_size) {
            Ok(backing) => backing,
            Err(e) => {
                error!("{e}");
                std::process::abort();
            }
        };

        let region = Region { start, size: real_size, backing };

        if let Err(e) = region.unmap::<P>() {
            error!("failed to release {real_size} bytes at {:p}: {e}", start);
        }
    }
}

/// Walks back from a user pointer to the start of its region.
///
/// Regions always start on a cache line, so the word right before the user
/// pointer lies in the same cache line as the header and rounding it down
/// lands exactly on the start.
unsafe fn region_start(user: NonNull<u8>) -> NonNull<u8> {
    let word = user.as_ptr() as usize - HEADER_SIZE;
    let padding = word - align_down(word, ALIGNMENT);

    unsafe { user.sub(HEADER_SIZE + padding) }
}

/// Validates a header read back from memory and tells which mechanism has
/// to free the region.
pub(crate) fn check_header(address: usize, size: usize) -> Result<Backing> {
    match size {
        HEAP_SENTINEL => Ok(Backing::Heap),
        size if size % HUGE_PAGE_SIZE == 0 => Ok(Backing::HugePages),
        size => Err(Error::CorruptHeader { address, size }),
    }
}
