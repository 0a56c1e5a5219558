//! One time, process wide preparation for huge pages.
//!
//! None of this runs on the allocation path. The host calls
//! [`enable_huge_pages`] once before its first acquire; without it the
//! allocator still works, but every request ends up in the fallback policy.

use std::{fs, io, path::Path};

use log::debug;

use crate::error::{Error, Result};

/// Directory describing the 2 MiB hugetlb pool on Linux.
pub const HUGETLB_POOL_DIR: &str = "/sys/kernel/mm/hugepages/hugepages-2048kB";

/// Size of the hugetlb pool reserved by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Pages reserved with `nr_hugepages`.
    pub total: usize,
    /// Pages not mapped by anyone yet.
    pub free: usize,
}

impl PoolStatus {
    /// Reads `nr_hugepages` and `free_hugepages` from a sysfs pool directory.
    pub fn read_from(dir: impl AsRef<Path>) -> io::Result<Self> {
        let dir = dir.as_ref();

        Ok(Self {
            total: read_counter(&dir.join("nr_hugepages"))?,
            free: read_counter(&dir.join("free_hugepages"))?,
        })
    }
}

fn read_counter(path: &Path) -> io::Result<usize> {
    fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{}: {e}", path.display())))
}

/// Status of the 2 MiB hugetlb pool, or `None` if the kernel doesn't expose it.
#[cfg(target_os = "linux")]
pub fn pool_status() -> Option<PoolStatus> {
    match PoolStatus::read_from(HUGETLB_POOL_DIR) {
        Ok(status) => Some(status),
        Err(e) => {
            log::warn!("can't read hugetlb pool at {HUGETLB_POOL_DIR}: {e}");
            None
        }
    }
}

/// Makes sure this process can get huge pages.
///
/// - Linux: checks the hugetlb pool has free pages. Reserving them
///   (`/proc/sys/vm/nr_hugepages`) is up to the host.
/// - Windows: enables `SeLockMemoryPrivilege` on the process token. The
///   account must have been granted the "Lock pages in memory" right.
/// - Anything else: nothing to do.
pub fn enable_huge_pages() -> Result<()> {
    platform::enable_huge_pages()
}

/// Turns a pool status into the result of [`enable_huge_pages`].
pub(crate) fn check_pool(status: PoolStatus) -> Result<()> {
    debug!("hugetlb pool: {} free of {} pages", status.free, status.total);

    match status.free {
        0 => Err(Error::PoolUnavailable { free: status.free, total: status.total }),
        _ => Ok(()),
    }
}

#[cfg(target_os = "linux")]
mod platform {
    use super::{HUGETLB_POOL_DIR, PoolStatus, check_pool};
    use crate::error::Result;

    pub(super) fn enable_huge_pages() -> Result<()> {
        check_pool(PoolStatus::read_from(HUGETLB_POOL_DIR)?)
    }
}

#[cfg(windows)]
mod platform {
    use std::{io, mem};

    use log::debug;

    use crate::error::{Error, Result};

    use windows::Win32::{
        Foundation::{CloseHandle, ERROR_NOT_ALL_ASSIGNED, GetLastError, HANDLE, LUID},
        Security::{
            AdjustTokenPrivileges, LUID_AND_ATTRIBUTES, LookupPrivilegeValueW,
            SE_LOCK_MEMORY_NAME, SE_PRIVILEGE_ENABLED, TOKEN_ADJUST_PRIVILEGES, TOKEN_PRIVILEGES,
            TOKEN_QUERY,
        },
        System::{
            Memory::GetLargePageMinimum,
            Threading::{GetCurrentProcess, OpenProcessToken},
        },
    };
    use windows::core::PCWSTR;

    fn os_error(e: windows::core::Error) -> Error {
        Error::Setup(io::Error::other(e.to_string()))
    }

    pub(super) fn enable_huge_pages() -> Result<()> {
        let minimum = unsafe { GetLargePageMinimum() };
        if minimum == 0 {
            return Err(Error::Setup(io::Error::new(
                io::ErrorKind::Unsupported,
                "large pages are not supported by this system",
            )));
        }
        debug!("large page minimum: {minimum} bytes");

        let mut token = HANDLE::default();

        unsafe {
            OpenProcessToken(GetCurrentProcess(), TOKEN_ADJUST_PRIVILEGES | TOKEN_QUERY, &mut token)
                .map_err(os_error)?;

            let result = enable_lock_memory(token);
            let _ = CloseHandle(token);

            result
        }
    }

    unsafe fn enable_lock_memory(token: HANDLE) -> Result<()> {
        let mut luid = LUID::default();

        unsafe {
            LookupPrivilegeValueW(PCWSTR::null(), SE_LOCK_MEMORY_NAME, &mut luid).map_err(os_error)?;

            let privileges = TOKEN_PRIVILEGES {
                PrivilegeCount: 1,
                Privileges: [LUID_AND_ATTRIBUTES { Luid: luid, Attributes: SE_PRIVILEGE_ENABLED }],
            };

            AdjustTokenPrivileges(
                token,
                false,
                Some(&privileges as *const TOKEN_PRIVILEGES),
                mem::size_of::<TOKEN_PRIVILEGES>() as u32,
                None,
                None,
            )
            .map_err(os_error)?;

            // AdjustTokenPrivileges succeeds even when the account lacks the right.
            if GetLastError() == ERROR_NOT_ALL_ASSIGNED {
                return Err(Error::PrivilegeNotHeld);
            }
        }

        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", windows)))]
mod platform {
    use crate::error::Result;

    pub(super) fn enable_huge_pages() -> Result<()> {
        Ok(())
    }
}
