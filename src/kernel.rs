use std::{io, ptr::NonNull};

/// Zero sized type that selects the memory primitives of the platform we
/// were compiled for. Nothing else in the crate touches syscalls directly.
pub(crate) struct Kernel;

/// This trait provides an abstraction to handle low level memory operations
/// and syscalls. Acquire and release have nothing to do with the concrete
/// APIs offered by each kernel, they only need these four primitives.
///
/// There are exactly two implementations, chosen with `cfg` at build time:
/// `mmap`/`munmap` on unix and `VirtualAlloc`/`VirtualFree` on windows.
pub(crate) trait PlatformMemory {
    /// Request `len` bytes backed by huge pages. `len` must be a non zero
    /// multiple of [`crate::HUGE_PAGE_SIZE`].
    unsafe fn request_huge_pages(len: usize) -> io::Result<NonNull<u8>>;

    /// Returns the huge page mapping of size `len` starting at `addr`.
    unsafe fn return_huge_pages(addr: NonNull<u8>, len: usize) -> io::Result<()>;

    /// Ordinary heap memory aligned to [`crate::ALIGNMENT`]. Used only as a
    /// fallback when huge pages are not available.
    unsafe fn request_heap(len: usize) -> Option<NonNull<u8>>;

    /// Frees memory given by [`PlatformMemory::request_heap`]. The heap
    /// remembers the size, so we don't need it.
    unsafe fn return_heap(addr: NonNull<u8>);
}

#[cfg(unix)]
mod unix {
    use super::{Kernel, PlatformMemory};
    use crate::utils::ALIGNMENT;

    use libc::{mmap, munmap, off_t, size_t};

    use std::{io, os::raw::{c_int, c_void}, ptr::{self, NonNull}};

    /// Linux encodes log2 of the page size in bits [31:26] of the flags.
    #[cfg(target_os = "linux")]
    fn huge_page_flags() -> io::Result<c_int> {
        const MAP_HUGE_SHIFT: c_int = 26;
        const MAP_HUGE_2MB: c_int = 21 << MAP_HUGE_SHIFT;

        Ok(libc::MAP_HUGETLB | MAP_HUGE_2MB)
    }

    /// XNU superpages, `VM_FLAGS_SUPERPAGE_SIZE_2MB << VM_FLAGS_SUPERPAGE_SHIFT`.
    #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
    fn huge_page_flags() -> io::Result<c_int> {
        Ok(1 << 16)
    }

    #[cfg(not(any(target_os = "linux", all(target_os = "macos", target_arch = "x86_64"))))]
    fn huge_page_flags() -> io::Result<c_int> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "2 MiB pages are not supported on this platform",
        ))
    }

    impl PlatformMemory for Kernel {
        unsafe fn request_huge_pages(len: usize) -> io::Result<NonNull<u8>> {
            // mmap parameters.
            const ADDR: *mut c_void = ptr::null_mut::<c_void>();
            // Read-Write only memory.
            const PROT: c_int = libc::PROT_READ | libc::PROT_WRITE;
            const FD: c_int = -1;
            const OFFSET: off_t = 0;

            let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | huge_page_flags()?;

            unsafe {
                let addr = mmap(ADDR, len as size_t, PROT, flags, FD, OFFSET);

                match addr {
                    libc::MAP_FAILED => Err(io::Error::last_os_error()),
                    addr => NonNull::new(addr.cast::<u8>())
                        .ok_or_else(|| io::Error::other("mmap returned a null mapping")),
                }
            }
        }

        unsafe fn return_huge_pages(addr: NonNull<u8>, len: usize) -> io::Result<()> {
            match unsafe { munmap(addr.as_ptr().cast::<c_void>(), len as size_t) } {
                0 => Ok(()),
                _ => Err(io::Error::last_os_error()),
            }
        }

        unsafe fn request_heap(len: usize) -> Option<NonNull<u8>> {
            let mut addr: *mut c_void = ptr::null_mut();

            match unsafe { libc::posix_memalign(&mut addr, ALIGNMENT, len as size_t) } {
                0 => NonNull::new(addr.cast::<u8>()),
                _ => None,
            }
        }

        unsafe fn return_heap(addr: NonNull<u8>) {
            unsafe { libc::free(addr.as_ptr().cast::<c_void>()) }
        }
    }
}

#[cfg(windows)]
mod windows {
    use std::{io, os::raw::c_void, ptr::NonNull};

    use crate::kernel::{Kernel, PlatformMemory};
    use crate::utils::ALIGNMENT;

    use windows::Win32::System::Memory;

    impl PlatformMemory for Kernel {
        unsafe fn request_huge_pages(len: usize) -> io::Result<NonNull<u8>> {
            // Read-Write only.
            let protection = Memory::PAGE_READWRITE;

            // Large pages can't be reserved and committed separately.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT | Memory::MEM_LARGE_PAGES;

            unsafe {
                let addr = Memory::VirtualAlloc(None, len, flags, protection);

                NonNull::new(addr.cast()).ok_or_else(io::Error::last_os_error)
            }
        }

        unsafe fn return_huge_pages(addr: NonNull<u8>, _len: usize) -> io::Result<()> {
            // MEM_RELEASE needs the base address and a size of 0.
            unsafe { Memory::VirtualFree(addr.as_ptr() as *mut c_void, 0, Memory::MEM_RELEASE) }
                .map_err(|e| io::Error::other(e.to_string()))
        }

        unsafe fn request_heap(len: usize) -> Option<NonNull<u8>> {
            unsafe { NonNull::new(libc::aligned_malloc(len, ALIGNMENT).cast::<u8>()) }
        }

        unsafe fn return_heap(addr: NonNull<u8>) {
            unsafe { libc::aligned_free(addr.as_ptr() as *mut c_void) }
        }
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Heap backed [`PlatformMemory`] that records every call, so tests can
    //! tell which release path was taken without real huge pages.

    use super::PlatformMemory;

    use std::{alloc::{self, Layout}, cell::RefCell, io, ptr::NonNull};

    use crate::utils::HUGE_PAGE_SIZE;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) enum Call {
        MapHuge(usize),
        UnmapHuge(usize),
        HeapAlloc(usize),
        HeapFree,
    }

    thread_local! {
        static CALLS: RefCell<Vec<Call>> = const { RefCell::new(Vec::new()) };
        static HUGE_PAGES_AVAILABLE: RefCell<bool> = const { RefCell::new(true) };
        static HEAP_SIZES: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    }

    /// Pretends to be the kernel.
    pub(crate) struct MockKernel;

    impl MockKernel {
        pub(crate) fn reset(huge_pages_available: bool) {
            CALLS.with(|calls| calls.borrow_mut().clear());
            HUGE_PAGES_AVAILABLE.with(|available| *available.borrow_mut() = huge_pages_available);
        }

        pub(crate) fn calls() -> Vec<Call> {
            CALLS.with(|calls| calls.borrow().clone())
        }

        fn record(call: Call) {
            CALLS.with(|calls| calls.borrow_mut().push(call));
        }
    }

    impl PlatformMemory for MockKernel {
        unsafe fn request_huge_pages(len: usize) -> io::Result<NonNull<u8>> {
            if !HUGE_PAGES_AVAILABLE.with(|available| *available.borrow()) {
                return Err(io::Error::from(io::ErrorKind::OutOfMemory));
            }
            Self::record(Call::MapHuge(len));

            let layout = Layout::from_size_align(len, HUGE_PAGE_SIZE).map_err(io::Error::other)?;
            NonNull::new(unsafe { alloc::alloc_zeroed(layout) })
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
        }

        unsafe fn return_huge_pages(addr: NonNull<u8>, len: usize) -> io::Result<()> {
            Self::record(Call::UnmapHuge(len));

            let layout = Layout::from_size_align(len, HUGE_PAGE_SIZE).map_err(io::Error::other)?;
            unsafe { alloc::dealloc(addr.as_ptr(), layout) };
            Ok(())
        }

        unsafe fn request_heap(len: usize) -> Option<NonNull<u8>> {
            Self::record(Call::HeapAlloc(len));

            let layout = Layout::from_size_align(len, crate::utils::ALIGNMENT).ok()?;
            let addr = NonNull::new(unsafe { alloc::alloc(layout) })?;
            HEAP_SIZES.with(|sizes| sizes.borrow_mut().push((addr.as_ptr() as usize, len)));
            Some(addr)
        }

        unsafe fn return_heap(addr: NonNull<u8>) {
            Self::record(Call::HeapFree);

            let len = HEAP_SIZES.with(|sizes| {
                let mut sizes = sizes.borrow_mut();
                let index = sizes
                    .iter()
                    .position(|(start, _)| *start == addr.as_ptr() as usize)
                    .expect("heap free of an address the mock never handed out");
                sizes.swap_remove(index).1
            });

            let layout = Layout::from_size_align(len, crate::utils::ALIGNMENT)
                .expect("layout was valid when allocated");
            unsafe { alloc::dealloc(addr.as_ptr(), layout) };
        }
    }
}
