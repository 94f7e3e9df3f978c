//! Wrappers around the libc memory mapping calls. Regions and the nursery get
//! their backing memory here, and decommit support returns the pages of swept
//! or evicted memory to the OS without unmapping the range.

use crate::util::Address;
use std::io::Result;

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), 0, len);
    }
}

fn wrap_libc_call<T: PartialEq>(f: &dyn Fn() -> T, expect: T) -> Result<()> {
    let ret = f();
    if ret == expect {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Mmap a fresh anonymous read-write range of `size` bytes, aligned to
/// `align`. Returns the start of the aligned range.
///
/// The kernel gives no alignment guarantee beyond page size, so we over-map by
/// `align` and trim the unaligned head and tail.
pub fn map_aligned(size: usize, align: usize) -> Result<Address> {
    use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE};
    debug_assert!(align.is_power_of_two());
    debug_assert!(size % crate::util::constants::BYTES_IN_PAGE == 0);

    let over = size + align;
    let raw = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            over,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if raw == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error());
    }

    let start = Address::from_mut_ptr(raw);
    let aligned = start.align_up(align);
    let head = aligned - start;
    let tail = align - head;
    if head != 0 {
        munmap(start, head)?;
    }
    if tail != 0 {
        munmap(aligned + size, tail)?;
    }
    Ok(aligned)
}

/// Unmap the given range.
pub fn munmap(start: Address, size: usize) -> Result<()> {
    wrap_libc_call(&|| unsafe { libc::munmap(start.to_mut_ptr(), size) }, 0)
}

/// Is the error number from a failed mmap an out-of-memory error?
pub fn is_mmap_oom(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOMEM)
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        /// Return the pages in the range to the OS. The mapping stays valid
        /// and reads as zero afterwards.
        pub fn decommit(start: Address, size: usize) -> Result<()> {
            wrap_libc_call(
                &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED) },
                0,
            )
        }
    } else if #[cfg(target_os = "macos")] {
        /// Return the pages in the range to the OS. The mapping stays valid
        /// afterwards. MADV_FREE frees the pages lazily, which is the best
        /// macOS offers.
        pub fn decommit(start: Address, size: usize) -> Result<()> {
            wrap_libc_call(
                &|| unsafe { libc::madvise(start.to_mut_ptr(), size, libc::MADV_FREE) },
                0,
            )
        }
    } else {
        /// Return the pages in the range to the OS. No-op on this platform.
        pub fn decommit(_start: Address, _size: usize) -> Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_aligned_is_aligned() {
        let align = 1 << 16;
        let addr = map_aligned(1 << 16, align).unwrap();
        assert!(addr.is_aligned_to(align));
        // Freshly mapped anonymous memory reads as zero.
        assert_eq!(unsafe { addr.load::<usize>() }, 0);
        munmap(addr, 1 << 16).unwrap();
    }

    #[test]
    fn decommitted_memory_stays_mapped() {
        let align = 1 << 16;
        let addr = map_aligned(1 << 16, align).unwrap();
        unsafe { addr.store::<usize>(0xdead_beef) };
        decommit(addr, 1 << 16).unwrap();
        // The mapping is still there, even though the page contents may have
        // been discarded.
        let _ = unsafe { addr.load::<usize>() };
        munmap(addr, 1 << 16).unwrap();
    }
}
