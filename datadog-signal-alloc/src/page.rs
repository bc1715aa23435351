// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use allocator_api2::alloc::AllocError;
use core::ptr::NonNull;
use std::sync::OnceLock;

/// Fallback when the OS refuses to report its page size. Every platform we
/// ship on uses 4 KiB or larger pages, and a too-small value only wastes a
/// little padding.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// The page-grained memory source behind every allocation the profiler makes
/// from signal context.
///
/// Implementations must return zeroed, page-aligned memory and must not take
/// locks or call into a general-purpose heap; a direct mapping primitive is
/// the only acceptable OS call.
pub trait PageAllocator {
    /// Returns at least `size` bytes of zeroed, page-aligned memory. The
    /// returned slice covers the whole mapping, which may be larger than
    /// `size` due to page rounding; callers may use the excess.
    fn safe_alloc(&self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    /// Releases a mapping previously returned by [`PageAllocator::safe_alloc`].
    ///
    /// # Safety
    ///
    /// `mapping` must be exactly the slice returned by a `safe_alloc` call on
    /// the same allocator, and it must not be accessed afterwards.
    unsafe fn safe_free(&self, mapping: NonNull<[u8]>);
}

/// Gets the system's page size, which will be a power of two. Cached so the
/// hot path never repeats the syscall.
#[inline]
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| os::page_size().unwrap_or(FALLBACK_PAGE_SIZE))
}

/// Rounds `bytes` up to a multiple of `pow2`, avoiding zero.
fn pad_to_pow2(bytes: usize, pow2: usize) -> Option<usize> {
    debug_assert!(pow2.is_power_of_two());

    let bytes = bytes.max(pow2);

    // For powers of two, bytes & (pow2 - 1) equals bytes % pow2.
    let remainder = bytes & (pow2 - 1);
    match remainder {
        0 => Some(bytes),
        _ => bytes.checked_add(pow2 - remainder),
    }
}

/// Allocates whole pages of virtual memory straight from the OS: mmap on
/// unix, `VirtualAlloc` on Windows. Intended for large allocations only,
/// such as backing chunks for other allocators.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsPageAllocator;

#[cfg(unix)]
mod os {
    use super::*;
    use core::ptr;

    pub(super) fn page_size() -> Result<usize, AllocError> {
        // SAFETY: sysconf with a valid name has no other preconditions.
        let result = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if result <= 0 {
            return Err(AllocError);
        }
        let size = result as usize;
        if size.is_power_of_two() {
            Ok(size)
        } else {
            Err(AllocError)
        }
    }

    impl PageAllocator for OsPageAllocator {
        fn safe_alloc(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
            if size == 0 {
                return Err(AllocError);
            }
            let len = pad_to_pow2(size, super::page_size()).ok_or(AllocError)?;

            let null = ptr::null_mut();
            let prot = libc::PROT_READ | libc::PROT_WRITE;
            let flags = libc::MAP_PRIVATE | libc::MAP_ANON;
            // SAFETY: these args create a fresh private anonymous mapping,
            // akin to malloc; anonymous mappings are zero-filled.
            let result = unsafe { libc::mmap(null, len as libc::size_t, prot, flags, -1, 0) };

            if result == libc::MAP_FAILED {
                return Err(AllocError);
            }

            // Without MAP_FIXED at address 0, the kernel does not hand out
            // a mapping starting at null.
            let addr = NonNull::new(result.cast::<u8>()).ok_or(AllocError)?;
            Ok(NonNull::slice_from_raw_parts(addr, len))
        }

        unsafe fn safe_free(&self, mapping: NonNull<[u8]>) {
            // SAFETY: by contract this is a mapping created by safe_alloc,
            // with its exact length.
            let _result = unsafe {
                libc::munmap(mapping.as_ptr().cast(), mapping.len() as libc::size_t)
            };
            debug_assert_ne!(-1, _result);
        }
    }
}

#[cfg(windows)]
mod os {
    use super::*;
    use core::{mem, ptr};
    use windows_sys::Win32::System::Memory;
    use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

    pub(super) fn page_size() -> Result<usize, AllocError> {
        let mut system_info = mem::MaybeUninit::<SYSTEM_INFO>::uninit();
        // SAFETY: calling C function with a correctly sized out-pointer;
        // GetSystemInfo is not documented to fail.
        let system_info = unsafe {
            GetSystemInfo(system_info.as_mut_ptr());
            system_info.assume_init()
        };

        let size = system_info.dwPageSize as usize;
        if size > 0 && size.is_power_of_two() {
            Ok(size)
        } else {
            Err(AllocError)
        }
    }

    impl PageAllocator for OsPageAllocator {
        fn safe_alloc(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
            if size == 0 {
                return Err(AllocError);
            }
            let len = pad_to_pow2(size, super::page_size()).ok_or(AllocError)?;

            let null = ptr::null_mut();
            let alloc_type = Memory::MEM_COMMIT | Memory::MEM_RESERVE;
            let protection = Memory::PAGE_READWRITE;
            // SAFETY: these args create a new allocation, akin to malloc;
            // committed pages are zero-filled.
            let result = unsafe { Memory::VirtualAlloc(null, len, alloc_type, protection) };

            let addr = NonNull::new(result.cast::<u8>()).ok_or(AllocError)?;
            Ok(NonNull::slice_from_raw_parts(addr, len))
        }

        unsafe fn safe_free(&self, mapping: NonNull<[u8]>) {
            // SAFETY: releasing an allocation made by VirtualAlloc; length
            // must be 0 with MEM_RELEASE.
            let _result = unsafe {
                Memory::VirtualFree(mapping.as_ptr().cast(), 0, Memory::MEM_RELEASE)
            };
            debug_assert_ne!(0, _result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::assert_page_backed;

    #[test]
    fn test_zero_sized() {
        _ = OsPageAllocator.safe_alloc(0).unwrap_err();
    }

    #[test]
    fn test_rounds_up_to_page_size() {
        let page = page_size();
        let alloc = OsPageAllocator;

        for request in [1, page - 1, page, page + 1] {
            let mapping = alloc.safe_alloc(request).unwrap();
            assert_page_backed(mapping, request);
            unsafe { alloc.safe_free(mapping) };
        }
    }

    #[test]
    fn test_memory_is_zeroed() {
        let alloc = OsPageAllocator;
        let mapping = alloc.safe_alloc(2 * page_size()).unwrap();

        // Reading is what this test is about; the mapping was never written.
        let slice = unsafe { mapping.as_ref() };
        assert!(slice.iter().all(|byte| *byte == 0));

        unsafe { alloc.safe_free(mapping) };
    }

    #[test]
    fn test_pad_to_pow2() {
        assert_eq!(Some(4096), pad_to_pow2(0, 4096));
        assert_eq!(Some(4096), pad_to_pow2(1, 4096));
        assert_eq!(Some(4096), pad_to_pow2(4096, 4096));
        assert_eq!(Some(8192), pad_to_pow2(4097, 4096));
        assert_eq!(None, pad_to_pow2(usize::MAX - 1, 4096));
    }

    #[test]
    fn test_page_size_is_pow2() {
        assert!(page_size().is_power_of_two());
    }
}
