//! This file contains the size and address arithmetic shared by both allocation APIs.
//! All of them are pure functions over power-of-two boundaries.

use std::mem;

/// Size of the huge pages we request from the kernel (2 MiB). This is the
/// universal size of the first tier of large pages on x86_64 and aarch64.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Every pointer handed to the user is aligned to a cache line.
pub const ALIGNMENT: usize = 64;

/// Bytes used by the in-band header that stores the real size of a region.
pub const HEADER_SIZE: usize = mem::size_of::<usize>();

/// Bytes reserved in front of the user pointer. Regions always start on a
/// boundary of at least [`ALIGNMENT`], so the header plus its padding takes
/// exactly one cache line.
pub(crate) const HEADER_RESERVE: usize = ALIGNMENT;

/// It aligns `to_be_aligned` using `aligment`.
///
/// `aligment` must be a power of two, otherwise the result is meaningless.
/// This is used to round region sizes up to [`HUGE_PAGE_SIZE`] and to
/// [`ALIGNMENT`].
#[inline]
pub const fn align(to_be_aligned: usize, aligment: usize) -> usize {
    (to_be_aligned + aligment - 1) & !(aligment - 1)
}

/// Smallest multiple of [`HUGE_PAGE_SIZE`] greater or equal than `size`.
#[inline]
pub const fn align_to_page_size(size: usize) -> usize {
    align(size, HUGE_PAGE_SIZE)
}

/// Number of bytes that have to be added to `address` so it becomes a
/// multiple of `aligment`. Already aligned addresses give 0.
#[inline]
pub const fn align_offset(address: usize, aligment: usize) -> usize {
    (aligment - (address & (aligment - 1))) & (aligment - 1)
}

/// Largest multiple of `aligment` lower or equal than `address`.
#[inline]
pub const fn align_down(address: usize, aligment: usize) -> usize {
    address & !(aligment - 1)
}

/// Size of the region we need to map so that `size` usable bytes fit after
/// the header. Returns `None` if the computation overflows.
///
/// ```text
/// +--------+---------+-------------------------------+---------+
/// | header | padding |        size usable bytes      | (slack) |
/// +--------+---------+-------------------------------+---------+
/// ^ start            ^ user pointer (64 aligned)        real_size ^
/// ```
pub fn region_size(size: usize) -> Option<usize> {
    let needed = size.checked_add(HEADER_RESERVE)?;

    // A huge page multiple is always a multiple of the cache line too, but
    // keep the rounding explicit in case the page size is ever lowered.
    checked_align_to_page_size(needed).map(|len| align(len, ALIGNMENT))
}

/// [`align_to_page_size`] that returns `None` instead of wrapping around.
pub fn checked_align_to_page_size(size: usize) -> Option<usize> {
    size.checked_add(HUGE_PAGE_SIZE - 1)
        .map(|_| align_to_page_size(size))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn align_pointer_size() {
        let aligments = vec![(1..8, 8), (9..16, 16), (17..24, 24), (25..32, 32)];

        for (sizes, expected) in aligments {
            for size in sizes {
                assert_eq!(expected, align(size, mem::size_of::<usize>()));
            }
        }
    }

    #[test]
    fn align_cache_line() {
        assert_eq!(0, align(0, ALIGNMENT));
        assert_eq!(64, align(1, ALIGNMENT));
        assert_eq!(64, align(64, ALIGNMENT));
        assert_eq!(128, align(65, ALIGNMENT));
    }

    #[test]
    fn align_huge_page_size() {
        assert_eq!(0, align_to_page_size(0));
        assert_eq!(HUGE_PAGE_SIZE, align_to_page_size(1));
        assert_eq!(HUGE_PAGE_SIZE, align_to_page_size(HUGE_PAGE_SIZE - 1));
        assert_eq!(HUGE_PAGE_SIZE, align_to_page_size(HUGE_PAGE_SIZE));
        assert_eq!(2 * HUGE_PAGE_SIZE, align_to_page_size(HUGE_PAGE_SIZE + 1));
    }

    #[test]
    fn offset_to_next_boundary() {
        assert_eq!(0, align_offset(0x1000, ALIGNMENT));
        assert_eq!(56, align_offset(0x1008, ALIGNMENT));
        assert_eq!(1, align_offset(0x103f, ALIGNMENT));
        assert_eq!(63, align_offset(0x1001, ALIGNMENT));
    }

    #[test]
    fn region_sizes_for_boundary_requests() {
        assert_eq!(Some(HUGE_PAGE_SIZE), region_size(0));
        assert_eq!(Some(HUGE_PAGE_SIZE), region_size(1));
        assert_eq!(Some(HUGE_PAGE_SIZE), region_size(HUGE_PAGE_SIZE - HEADER_RESERVE));
        assert_eq!(Some(2 * HUGE_PAGE_SIZE), region_size(HUGE_PAGE_SIZE - HEADER_RESERVE + 1));
        assert_eq!(Some(2 * HUGE_PAGE_SIZE), region_size(HUGE_PAGE_SIZE));
        assert_eq!(Some(2 * HUGE_PAGE_SIZE), region_size(HUGE_PAGE_SIZE + 1));
    }

    #[test]
    fn checked_page_alignment() {
        assert_eq!(Some(HUGE_PAGE_SIZE), checked_align_to_page_size(7));
        assert_eq!(None, checked_align_to_page_size(usize::MAX));
    }

    #[test]
    fn region_size_overflow() {
        assert_eq!(None, region_size(usize::MAX));
        assert_eq!(None, region_size(usize::MAX - HEADER_RESERVE));
    }

    proptest! {
        #[test]
        fn offset_reaches_boundary(address in 0usize..usize::MAX / 2, shift in 0u32..22) {
            let aligment = 1usize << shift;
            let offset = align_offset(address, aligment);

            prop_assert!(offset < aligment);
            prop_assert_eq!(0, (address + offset) % aligment);
            prop_assert_eq!(offset, align_offset(address, aligment));
        }

        #[test]
        fn align_down_is_inverse_of_header_offset(base in 0usize..(1usize << 40)) {
            // Any start aligned to 64 bytes.
            let start = base * ALIGNMENT;
            let user = start + HEADER_SIZE + align_offset(start + HEADER_SIZE, ALIGNMENT);

            prop_assert_eq!(start + HEADER_RESERVE, user);
            prop_assert_eq!(start, align_down(user - HEADER_SIZE, ALIGNMENT));
        }

        #[test]
        fn region_fits_request(size in 0usize..(1usize << 34)) {
            let real = region_size(size).unwrap();

            prop_assert_eq!(0, real % HUGE_PAGE_SIZE);
            prop_assert_eq!(0, real % ALIGNMENT);
            prop_assert!(real >= size + HEADER_RESERVE);
            prop_assert!(real < size + HEADER_RESERVE + HUGE_PAGE_SIZE);
        }
    }
}
