// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared assertions for the allocator tests.

#[cfg(test)]
use crate::{ChainAllocator, PageAllocator};
#[cfg(test)]
use core::ptr::NonNull;

/// Asserts that `mapping` honors the page source contract: the base is
/// page-aligned and the length is a whole number of pages covering at least
/// `requested` bytes.
#[cfg(test)]
#[track_caller]
pub(crate) fn assert_page_backed(mapping: NonNull<[u8]>, requested: usize) {
    let page = crate::page_size();
    let base = mapping.as_ptr() as *mut u8 as usize;
    assert_eq!(0, base % page, "mapping base is not page-aligned");
    assert_eq!(0, mapping.len() % page, "mapping is not whole pages");
    assert!(mapping.len() >= requested);
}

/// Drives one allocation against a chain allocator and checks the bump
/// contract: a successful allocation is aligned, exactly the requested
/// size, usable at both ends, and accounted for in `used_bytes`; a failed
/// one (zero-sized, over-aligned, or larger than a chunk) leaves the chain
/// untouched.
#[cfg(test)]
pub(crate) fn exercise_chain<P: PageAllocator>(
    alloc: &ChainAllocator<P>,
    size: usize,
    align_bits: u32,
    val: u8,
    max_size: usize,
) {
    use crate::Allocator;
    use core::alloc::Layout;

    let Some(align) = 1usize.checked_shl(align_bits) else {
        return;
    };
    let Ok(layout) = Layout::from_size_align(size, align) else {
        return;
    };
    if layout.pad_to_align().size() > max_size {
        return;
    }

    let used_before = alloc.used_bytes();
    let chunks_before = alloc.chunk_count();

    match alloc.allocate(layout) {
        Ok(mut allocation) => {
            let base = allocation.cast::<u8>().as_ptr();
            assert_eq!(0, base as usize % align, "allocation is misaligned");

            // The chain hands out exactly the requested size; bump math
            // that over- or under-counted would show up here.
            let block = unsafe { allocation.as_mut() };
            assert_eq!(size, block.len());
            let used_after = alloc.used_bytes();
            assert!(used_after >= used_before + size);
            assert!(used_after <= alloc.reserved_bytes());

            // Writes to both ends of the block must stick; overlapping
            // blocks from a chunk-boundary bug would clobber them.
            block[0] = val;
            assert_eq!(val, block[0]);
            block[size - 1] = val.wrapping_add(1);
            assert_eq!(val.wrapping_add(1), block[size - 1]);

            // deallocate is an arena no-op and must not unmap chunks.
            unsafe { alloc.deallocate(allocation.cast(), layout) };
            assert_eq!(used_after, alloc.used_bytes());
            assert!(alloc.chunk_count() >= chunks_before);
        }
        Err(_) => {
            // Failure must not consume bytes or leave chunks behind.
            assert_eq!(used_before, alloc.used_bytes());
            assert_eq!(chunks_before, alloc.chunk_count());
        }
    }
}
