//! Handle based front end.
//!
//! Instead of hiding the region size in front of the user pointer, the
//! allocator keeps an explicit table of `(start, size, backing)` records and
//! hands out opaque [`Handle`]s that index into it. Acquire and release are
//! both O(1) and a stale handle is reported as an error instead of being
//! undefined behaviour.

use std::{fmt, ptr::NonNull, slice};

use log::{debug, error};

use crate::{
    config::Config,
    error::{Error, Result},
    kernel::{Kernel, PlatformMemory},
    region::{Backing, Region},
    utils::checked_align_to_page_size,
};

/// Opaque reference to a region owned by a [`HugeAllocator`].
///
/// Slot indices are recycled once a region is released, the generation
/// tells an old handle apart from the one that reuses its slot.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}v{})", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    region: Option<Region>,
}

/// Allocator that owns every region it hands out.
///
/// ```text
///   Handle { index: 1, generation: 3 }
///                  |
///                  v
/// +--------+--------------------+--------+
/// | slot 0 |       slot 1       | slot 2 |
/// |  None  | start, size, Huge  |  ...   |
/// +--------+--------------------+--------+
///                  |
///                  v
///        +--------------------+
///        |   Region (mmap)    |
///        +--------------------+
/// ```
///
/// Every region still live when the allocator is dropped is released.
///
/// The allocator is not thread safe: it holds raw pointers, so it is neither
/// `Send` nor `Sync`.
pub struct HugeAllocator {
    config: Config,
    slots: Vec<Slot>,
    /// Indices of the slots whose region was released.
    vacant: Vec<u32>,
    live: usize,
}

impl HugeAllocator {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            slots: Vec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of regions acquired and not released yet.
    #[inline]
    pub fn live(&self) -> usize {
        self.live
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Maps a region of at least `size` bytes, rounded up to a multiple of
    /// [`crate::HUGE_PAGE_SIZE`]. Zero sized requests still get one page.
    ///
    /// The memory is zeroed.
    pub fn acquire(&mut self, size: usize) -> Result<Handle> {
        self.acquire_in::<Kernel>(size)
    }

    /// Gives the region referenced by `handle` back to the kernel.
    pub fn release(&mut self, handle: Handle) -> Result<()> {
        self.release_in::<Kernel>(handle)
    }

    /// Start of the region. Aligned to [`crate::HUGE_PAGE_SIZE`] when it is backed
    /// by huge pages and to [`crate::ALIGNMENT`] otherwise.
    pub fn as_ptr(&self, handle: Handle) -> Result<NonNull<u8>> {
        self.region(handle).map(|region| region.start)
    }

    /// Usable size of the region.
    pub fn len(&self, handle: Handle) -> Result<usize> {
        self.region(handle).map(|region| region.size)
    }

    pub fn backing(&self, handle: Handle) -> Result<Backing> {
        self.region(handle).map(|region| region.backing)
    }

    /// Borrow the whole region as a byte slice.
    ///
    /// Freshly acquired huge pages are zeroed by the kernel, heap fallback
    /// memory is zeroed on acquire as well, so the slice never exposes
    /// uninitialized bytes.
    pub fn as_mut_slice(&mut self, handle: Handle) -> Result<&mut [u8]> {
        let region = self.region(handle)?;

        // SAFETY: the region is live, initialized and exclusively borrowed
        // through `self` for the lifetime of the slice.
        unsafe { Ok(slice::from_raw_parts_mut(region.start.as_ptr(), region.size)) }
    }

    fn region(&self, handle: Handle) -> Result<Region> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.region)
            .ok_or(Error::InvalidHandle(handle))
    }

    fn acquire_in<P: PlatformMemory>(&mut self, size: usize) -> Result<Handle> {
        let real_size = checked_align_to_page_size(size.max(1)).ok_or(Error::SizeOverflow(size))?;

        // Handles index the table with a u32.
        if self.vacant.is_empty() && self.slots.len() > u32::MAX as usize {
            return Err(Error::TableFull);
        }

        let region = unsafe { Region::map::<P>(real_size, self.config.fallback)? };

        if region.backing == Backing::Heap {
            // Anonymous mappings come zeroed, the heap doesn't.
            unsafe { region.start.write_bytes(0, region.size) };
        }

        let handle = match self.vacant.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.region = Some(region);
                Handle { index, generation: slot.generation }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot { generation: 0, region: Some(region) });
                Handle { index, generation: 0 }
            }
        };

        self.live += 1;
        debug!("acquired {handle:?}: {real_size} bytes ({:?})", region.backing);

        Ok(handle)
    }

    fn release_in<P: PlatformMemory>(&mut self, handle: Handle) -> Result<()> {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .ok_or(Error::InvalidHandle(handle))?;

        let region = slot.region.take().ok_or(Error::InvalidHandle(handle))?;

        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(handle.index);
        self.live -= 1;

        debug!("releasing {handle:?}");
        unsafe { region.unmap::<P>() }.map_err(|source| Error::HugePages {
            size: region.size,
            source,
        })
    }

    fn release_all<P: PlatformMemory>(&mut self) {
        for slot in &mut self.slots {
            if let Some(region) = slot.region.take() {
                if let Err(e) = unsafe { region.unmap::<P>() } {
                    error!("failed to release {} bytes at {:p}: {e}", region.size, region.start);
                }
            }
        }

        self.slots.clear();
        self.vacant.clear();
        self.live = 0;
    }
}

impl Default for HugeAllocator {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Drop for HugeAllocator {
    fn drop(&mut self) {
        self.release_all::<Kernel>();
    }
}
