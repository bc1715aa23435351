// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::page::{page_size, OsPageAllocator, PageAllocator};
use allocator_api2::alloc::{AllocError, Allocator};
use core::alloc::Layout;
use core::mem;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

/// Default chunk reservation, sized so a profiling session rarely needs a
/// second mapping.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Header at the base of every mapped chunk. The allocatable region is the
/// rest of the mapping.
#[repr(C)]
struct Chunk {
    /// Next (newer) chunk in the chain, or null for the last one.
    next: AtomicPtr<Chunk>,
    /// Offset of the first free byte, measured from the chunk base.
    offset: AtomicUsize,
    /// Total mapped bytes, header included.
    size: usize,
}

impl Chunk {
    const HEADER_SIZE: usize = mem::size_of::<Chunk>();

    /// Maps a fresh chunk. The mapping arrives zeroed, so only header fields
    /// with non-zero initial values need a store.
    fn map<P: PageAllocator>(chunk_size: usize, pages: &P) -> Result<NonNull<Chunk>, AllocError> {
        let mapping = pages.safe_alloc(chunk_size.max(Self::HEADER_SIZE))?;
        let size = mapping.len();
        let chunk = mapping.cast::<Chunk>();
        // SAFETY: the mapping is page-aligned, which is more than enough for
        // the header, and at least HEADER_SIZE bytes long.
        unsafe {
            ptr::addr_of_mut!((*chunk.as_ptr()).offset).write(AtomicUsize::new(Self::HEADER_SIZE));
            ptr::addr_of_mut!((*chunk.as_ptr()).size).write(size);
        }
        Ok(chunk)
    }

    /// # Safety
    ///
    /// `this` must come from [`Chunk::map`] on the same pages source, and the
    /// chunk must not be accessed afterwards.
    unsafe fn unmap<P: PageAllocator>(this: NonNull<Chunk>, pages: &P) {
        // SAFETY: the header is still live here.
        let size = unsafe { this.as_ref() }.size;
        let mapping = NonNull::slice_from_raw_parts(this.cast::<u8>(), size);
        // SAFETY: forwarding the exact mapping returned by safe_alloc.
        unsafe { pages.safe_free(mapping) };
    }

    /// Carves `layout` out of this chunk with an atomic bump, or returns
    /// `None` if the remaining space cannot hold it.
    ///
    /// # Safety
    ///
    /// `this` must point to a live chunk mapping.
    unsafe fn try_alloc(this: NonNull<Chunk>, layout: Layout) -> Option<NonNull<[u8]>> {
        // SAFETY: the header stays valid for the mapping's lifetime.
        let chunk = unsafe { this.as_ref() };
        let mut offset = chunk.offset.load(Ordering::Relaxed);
        loop {
            let start = align_up(offset, layout.align())?;
            let end = start.checked_add(layout.size())?;
            if end > chunk.size {
                return None;
            }
            // Relaxed suffices: the bytes handed out here are published to
            // other threads only through the caller's own synchronization.
            match chunk
                .offset
                .compare_exchange_weak(offset, end, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => {
                    // SAFETY: start..end is in bounds of the mapping, and the
                    // base pointer retains provenance over all of it.
                    let thin = unsafe { this.cast::<u8>().as_ptr().add(start) };
                    let wide = ptr::slice_from_raw_parts_mut(thin, layout.size());
                    // SAFETY: derived from a non-null mapping base.
                    return Some(unsafe { NonNull::new_unchecked(wide) });
                }
                Err(current) => offset = current,
            }
        }
    }
}

/// Rounds `offset` up to a multiple of `align` (a power of two).
fn align_up(offset: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    offset.checked_add(mask).map(|padded| padded & !mask)
}

/// A bump allocator over a chain of large page-backed chunks.
///
/// Allocation is lock-free: a CAS bump inside the current chunk, with a new
/// chunk mapped and CAS-linked on exhaustion. Individual deallocation does
/// nothing; memory is reclaimed wholesale by [`ChainAllocator::clear`] or by
/// dropping the allocator. Requests larger than a chunk fail instead of
/// mapping an oversized chunk.
///
/// Safe to call from a signal handler: the only OS interaction is the pages
/// source, and the first chunk is reserved eagerly at construction so the
/// common case never maps at all.
#[derive(Debug)]
pub struct ChainAllocator<P: PageAllocator = OsPageAllocator> {
    /// Oldest chunk. It survives [`ChainAllocator::clear`], so the allocator
    /// is never without memory.
    head: NonNull<Chunk>,
    /// Chunk that currently serves allocations.
    tail: AtomicPtr<Chunk>,
    /// Requested bytes per chunk; the mapping may be page-padded beyond it.
    chunk_size: usize,
    /// Actual capacity of a mapped chunk, used to reject oversized requests
    /// without mapping anything.
    chunk_capacity: usize,
    pages: P,
}

// SAFETY: all shared-state mutation goes through atomics; the chunks are
// plain memory owned by this allocator until clear()/drop, which require
// exclusive access.
unsafe impl<P: PageAllocator + Send> Send for ChainAllocator<P> {}
unsafe impl<P: PageAllocator + Sync> Sync for ChainAllocator<P> {}

impl ChainAllocator<OsPageAllocator> {
    /// Creates a chain backed by OS pages, reserving the first chunk.
    pub fn try_new(chunk_size: usize) -> Result<Self, AllocError> {
        Self::try_new_in(chunk_size, OsPageAllocator)
    }
}

impl<P: PageAllocator> ChainAllocator<P> {
    /// Creates a chain backed by `pages`, reserving the first chunk.
    pub fn try_new_in(chunk_size: usize, pages: P) -> Result<Self, AllocError> {
        let head = Chunk::map(chunk_size, &pages)?;
        // SAFETY: freshly mapped and not shared yet.
        let chunk_capacity = unsafe { head.as_ref() }.size;
        Ok(Self {
            head,
            tail: AtomicPtr::new(head.as_ptr()),
            chunk_size,
            chunk_capacity,
            pages,
        })
    }

    /// Requested bytes per chunk.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn allocate_impl(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 || layout.align() > page_size() {
            return Err(AllocError);
        }
        // Fail fast on requests no chunk could ever satisfy.
        let worst_case_start = align_up(Chunk::HEADER_SIZE, layout.align()).ok_or(AllocError)?;
        let worst_case_end = worst_case_start
            .checked_add(layout.size())
            .ok_or(AllocError)?;
        if worst_case_end > self.chunk_capacity {
            return Err(AllocError);
        }

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: chunks are unmapped only by clear()/drop, which require
            // exclusive access, so the tail is live.
            let tail_nn = unsafe { NonNull::new_unchecked(tail) };
            if let Some(allocation) = unsafe { Chunk::try_alloc(tail_nn, layout) } {
                return Ok(allocation);
            }

            // The current chunk is exhausted. Follow the chain if another
            // thread already extended it.
            // SAFETY: live for the same reason as above.
            let next = unsafe { tail_nn.as_ref() }.next.load(Ordering::Acquire);
            if !next.is_null() {
                _ = self
                    .tail
                    .compare_exchange(tail, next, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            let fresh = Chunk::map(self.chunk_size, &self.pages)?;
            // SAFETY: freshly mapped, not shared yet.
            let Some(allocation) = (unsafe { Chunk::try_alloc(fresh, layout) }) else {
                // The pages source returned a smaller mapping than expected
                // and the request does not fit it either.
                // SAFETY: never linked, no other thread can see it.
                unsafe { Chunk::unmap(fresh, &self.pages) };
                return Err(AllocError);
            };

            // SAFETY: tail is live; see above.
            let link = unsafe { tail_nn.as_ref() }.next.compare_exchange(
                ptr::null_mut(),
                fresh.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            match link {
                Ok(_) => {
                    _ = self.tail.compare_exchange(
                        tail,
                        fresh.as_ptr(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    return Ok(allocation);
                }
                Err(_) => {
                    // Another thread extended the chain first; discard ours
                    // and retry against the winner's chunk.
                    // SAFETY: never linked, no other thread can see it.
                    unsafe { Chunk::unmap(fresh, &self.pages) };
                }
            }
        }
    }

    /// Releases every chunk except the first and resets the bump offset.
    /// Invalidates every pointer previously returned by this allocator.
    pub fn clear(&mut self) {
        let head = self.head;
        // SAFETY: exclusive access, so no allocation races with the walk and
        // every pointer handed out is already invalid by contract.
        unsafe {
            let mut chunk = head.as_ref().next.swap(ptr::null_mut(), Ordering::Relaxed);
            while let Some(live) = NonNull::new(chunk) {
                let next = live.as_ref().next.load(Ordering::Relaxed);
                Chunk::unmap(live, &self.pages);
                chunk = next;
            }
            head.as_ref()
                .offset
                .store(Chunk::HEADER_SIZE, Ordering::Relaxed);
        }
        *self.tail.get_mut() = head.as_ptr();
    }

    fn fold_chunks<T>(&self, init: T, fold: impl Fn(T, &Chunk) -> T) -> T {
        let mut acc = init;
        let mut chunk = self.head.as_ptr();
        while let Some(live) = NonNull::new(chunk) {
            // SAFETY: chain nodes stay mapped while the allocator is alive.
            let header = unsafe { live.as_ref() };
            acc = fold(acc, header);
            chunk = header.next.load(Ordering::Acquire);
        }
        acc
    }

    /// Bytes handed out so far, alignment padding included. Approximate
    /// while other threads are allocating.
    pub fn used_bytes(&self) -> usize {
        self.fold_chunks(0, |acc, chunk| {
            acc + (chunk.offset.load(Ordering::Relaxed) - Chunk::HEADER_SIZE)
        })
    }

    /// Bytes reserved from the pages source, headers included. This number
    /// is greater than or equal to [`Self::used_bytes`].
    pub fn reserved_bytes(&self) -> usize {
        self.fold_chunks(0, |acc, chunk| acc + chunk.size)
    }

    /// Number of chunks currently mapped.
    pub fn chunk_count(&self) -> usize {
        self.fold_chunks(0, |acc, _| acc + 1)
    }
}

impl<P: PageAllocator> Drop for ChainAllocator<P> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; every chunk in the chain came from map().
        unsafe {
            let mut chunk = self.head.as_ptr();
            while let Some(live) = NonNull::new(chunk) {
                let next = live.as_ref().next.load(Ordering::Relaxed);
                Chunk::unmap(live, &self.pages);
                chunk = next;
            }
        }
    }
}

unsafe impl<P: PageAllocator> Allocator for ChainAllocator<P> {
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate_impl(layout)
    }

    unsafe fn deallocate(&self, _ptr: NonNull<u8>, _layout: Layout) {
        // Arena semantics: memory is reclaimed wholesale by clear() or drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::exercise_chain;
    use bolero::TypeGenerator;
    use std::sync::Barrier;

    #[test]
    fn test_basics() -> Result<(), AllocError> {
        let alloc = ChainAllocator::try_new(DEFAULT_CHUNK_SIZE)?;
        const WIDTH: usize = 8;
        let layout = Layout::new::<[u8; WIDTH]>();

        let first = alloc.allocate(layout)?;
        let second = alloc.allocate(layout)?;
        let third = alloc.allocate(layout)?;

        assert_eq!(WIDTH, first.len());
        assert_eq!(WIDTH, second.len());
        assert_eq!(WIDTH, third.len());
        assert_eq!(3 * WIDTH, alloc.used_bytes());
        assert_eq!(1, alloc.chunk_count());

        let first = first.as_ptr() as *mut u8;
        let second = second.as_ptr() as *mut u8;
        let third = third.as_ptr() as *mut u8;

        // Same chunk, so the blocks are laid out back to back.
        unsafe {
            assert_eq!(WIDTH, second.offset_from(first) as usize);
            assert_eq!(WIDTH, third.offset_from(second) as usize);
        }

        Ok(())
    }

    #[test]
    fn test_alignment() -> Result<(), AllocError> {
        let alloc = ChainAllocator::try_new(DEFAULT_CHUNK_SIZE)?;

        // Allocate smallest to largest so each step forces padding.
        _ = alloc.allocate(Layout::new::<u8>())?;
        for align_to in [2usize, 4, 8, 16, 64] {
            let layout = Layout::from_size_align(align_to, align_to).map_err(|_| AllocError)?;
            let allocation = alloc.allocate(layout)?;
            assert_eq!(0, allocation.cast::<u8>().as_ptr() as usize % align_to);
            _ = alloc.allocate(Layout::new::<u8>())?;
        }
        Ok(())
    }

    #[test]
    fn test_zero_sized() {
        let alloc = ChainAllocator::try_new(DEFAULT_CHUNK_SIZE).unwrap();
        _ = alloc.allocate(Layout::new::<()>()).unwrap_err();
    }

    #[test]
    fn test_chunk_growth() -> Result<(), AllocError> {
        // One page per chunk makes exhaustion cheap to reach.
        let alloc = ChainAllocator::try_new(1)?;
        let chunk_bytes = alloc.reserved_bytes();
        let layout = Layout::from_size_align(chunk_bytes / 2, 8).map_err(|_| AllocError)?;

        let first = alloc.allocate(layout)?;
        assert_eq!(1, alloc.chunk_count());

        // The second half-chunk block does not fit after the header, so a
        // new chunk gets mapped.
        let second = alloc.allocate(layout)?;
        assert_eq!(2, alloc.chunk_count());
        assert_ne!(first.as_ptr() as *mut u8, second.as_ptr() as *mut u8);

        Ok(())
    }

    #[test]
    fn test_oversized_request_fails() {
        let alloc = ChainAllocator::try_new(1).unwrap();
        let chunk_bytes = alloc.reserved_bytes();

        let layout = Layout::from_size_align(2 * chunk_bytes, 8).unwrap();
        _ = alloc.allocate(layout).unwrap_err();

        // Failing must not have mapped anything.
        assert_eq!(1, alloc.chunk_count());

        // A fitting request still succeeds afterwards.
        _ = alloc.allocate(Layout::new::<u64>()).unwrap();
    }

    #[test]
    fn test_clear_returns_to_one_chunk() {
        let mut alloc = ChainAllocator::try_new(1).unwrap();
        let chunk_bytes = alloc.reserved_bytes();
        let layout = Layout::from_size_align(chunk_bytes / 2, 8).unwrap();

        for _ in 0..5 {
            _ = alloc.allocate(layout).unwrap();
        }
        assert!(alloc.chunk_count() > 1);

        alloc.clear();
        assert_eq!(1, alloc.chunk_count());
        assert_eq!(0, alloc.used_bytes());

        // The retained chunk serves allocations again.
        let after = alloc.allocate(layout).unwrap();
        assert_eq!(layout.size(), alloc.used_bytes());
        drop(after);
    }

    /// Page source that fails after a configurable number of mappings.
    #[derive(Clone, Debug)]
    struct FlakyPages {
        remaining: std::sync::Arc<AtomicUsize>,
    }

    impl FlakyPages {
        fn new(allowed: usize) -> Self {
            Self {
                remaining: std::sync::Arc::new(AtomicUsize::new(allowed)),
            }
        }
    }

    impl PageAllocator for FlakyPages {
        fn safe_alloc(&self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
            self.remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| {
                    left.checked_sub(1)
                })
                .map_err(|_| AllocError)?;
            OsPageAllocator.safe_alloc(size)
        }

        unsafe fn safe_free(&self, mapping: NonNull<[u8]>) {
            unsafe { OsPageAllocator.safe_free(mapping) };
        }
    }

    #[test]
    fn test_page_exhaustion() {
        _ = ChainAllocator::try_new_in(1, FlakyPages::new(0)).unwrap_err();

        let alloc = ChainAllocator::try_new_in(1, FlakyPages::new(1)).unwrap();
        let chunk_bytes = alloc.reserved_bytes();
        let layout = Layout::from_size_align(chunk_bytes / 2, 8).unwrap();

        _ = alloc.allocate(layout).unwrap();
        // Needs a second chunk, which the pages source refuses.
        _ = alloc.allocate(layout).unwrap_err();
        assert_eq!(1, alloc.chunk_count());

        // Smaller requests that still fit the first chunk keep working.
        _ = alloc.allocate(Layout::new::<u64>()).unwrap();
    }

    #[test]
    fn test_concurrent_allocations_do_not_overlap() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 1000;

        // Small chunks force concurrent chain growth.
        let alloc = ChainAllocator::try_new(4096).unwrap();
        let barrier = Barrier::new(THREADS);
        let layout = Layout::new::<u64>();

        // Addresses travel between threads as usize; raw pointers are not
        // Send.
        let mut slots: Vec<usize> = std::thread::scope(|scope| {
            let mut handles = Vec::with_capacity(THREADS);
            for thread in 0..THREADS {
                let alloc = &alloc;
                let barrier = &barrier;
                handles.push(scope.spawn(move || {
                    barrier.wait();
                    let mut mine = Vec::with_capacity(PER_THREAD);
                    for i in 0..PER_THREAD {
                        let allocation = alloc.allocate(layout).unwrap();
                        let slot = allocation.as_ptr() as *mut u64;
                        // Tag the slot; overlap would clobber another tag.
                        unsafe { slot.write((thread * PER_THREAD + i) as u64) };
                        mine.push(slot as usize);
                    }
                    mine
                }));
            }
            handles
                .into_iter()
                .flat_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(THREADS * PER_THREAD, slots.len());
        let mut tags: Vec<u64> = slots
            .iter()
            .map(|slot| unsafe { (*slot as *const u64).read() })
            .collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(THREADS * PER_THREAD, tags.len());

        slots.sort_unstable();
        slots.dedup();
        assert_eq!(THREADS * PER_THREAD, slots.len());
    }

    #[test]
    fn test_auto_traits() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}
        require_send::<ChainAllocator>();
        require_sync::<ChainAllocator>();
    }

    #[test]
    fn fuzz() {
        // Bounded so the fuzzer cannot run the host out of memory.
        const MAX_SIZE: usize = 0x100000;

        let size = 0..=MAX_SIZE;
        let align_bits = 0..=32u32;
        let val = u8::produce();
        let allocs = Vec::<(usize, u32, u8)>::produce()
            .with()
            .values((size, align_bits, val));
        bolero::check!()
            .with_generator(allocs)
            .for_each(|size_align_vec| {
                let allocator = ChainAllocator::try_new(0x10000).unwrap();
                for (size, align_bits, val) in size_align_vec {
                    exercise_chain(&allocator, *size, *align_bits, *val, MAX_SIZE);
                }
            })
    }
}
