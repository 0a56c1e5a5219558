//! Memory backed by 2 MiB pages, for workloads that suffer from TLB misses.
//!
//! There are two ways of using it:
//!
//! - [`acquire`] / [`release`]: raw pointers. The real size of each region is
//!   stored in a header right before the returned pointer, so release only
//!   needs the pointer back.
//! - [`HugeAllocator`]: opaque [`Handle`]s into a table owned by the
//!   allocator. No in-band header and stale handles are detected.
//!
//! Every call maps a fresh region; nothing is pooled or reused.
//!
//! ```text
//!                 acquire(size)
//!                      |
//!          +-----------v-----------+        fails       +-----------------+
//!          |  mmap(MAP_HUGETLB) /  | -----------------> | Fallback policy |
//!          |  VirtualAlloc(LARGE)  |                    |  Heap  |  Fail  |
//!          +-----------+-----------+                    +----+-------+----+
//!                      |                                     |       |
//!                      v                                     v       v
//!            header = real size                   header = 0       null
//! ```
//!
//! Huge pages have to be made available by the host before they can be
//! used, see [`enable_huge_pages`].

mod config;
mod error;
mod header;
mod kernel;
mod region;
mod setup;
mod table;
mod utils;

pub use config::{Config, FALLBACK_ENV, Fallback, ParseFallbackError};
pub use error::{Error, Result};
pub use header::{acquire, acquire_with, release};
pub use region::Backing;
#[cfg(target_os = "linux")]
pub use setup::pool_status;
pub use setup::{HUGETLB_POOL_DIR, PoolStatus, enable_huge_pages};
pub use table::{Handle, HugeAllocator};
pub use utils::{
    ALIGNMENT, HEADER_SIZE, HUGE_PAGE_SIZE, align, align_down, align_offset, align_to_page_size,
    checked_align_to_page_size, region_size,
};
