// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::generation::{Generation, INITIAL_CAPACITY};
use crate::hash;
use crate::trace::{CallFrame, CallTrace};
use allocator_api2::alloc::Allocator;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use datadog_signal_alloc::{
    AllocError, ChainAllocator, OsPageAllocator, PageAllocator, DEFAULT_CHUNK_SIZE,
};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors surfaced by storage construction. The hot path never returns
/// errors; [`CallTraceStorage::put`] signals failure in-band with
/// identifier zero.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The OS refused the page mapping for the initial generation or the
    /// first arena chunk.
    #[error("call trace storage: out of memory")]
    OutOfMemory,
}

impl From<AllocError> for StorageError {
    fn from(_: AllocError) -> Self {
        StorageError::OutOfMemory
    }
}

/// Concurrent intern table for sampled call traces.
///
/// [`CallTraceStorage::put`] deduplicates a captured stack against every
/// stack observed before and returns a compact identifier for it, so a
/// sample record can reference the stack without copying it. Writers may
/// run on arbitrary threads, including inside asynchronous signal handlers:
/// the put path takes no locks, never touches the process heap, and the
/// only OS call it can make is a fresh page mapping.
///
/// Traces are interned by their 64-bit hash alone. Two distinct frame
/// sequences that collide on the full hash are merged into one identifier.
/// This is a deliberate trade: an exact payload comparison cannot run under
/// the claiming CAS without reading variable-length data on the hot path.
///
/// The table grows by chaining generations of doubled capacity; identifiers
/// from different generations never overlap, and an interned payload is
/// shared by reference when a trace resurfaces after growth.
pub struct CallTraceStorage<P: PageAllocator = OsPageAllocator> {
    /// Newest generation; older ones are reached through its `prev` chain.
    current: AtomicPtr<Generation>,
    /// Arena for the interned `CallTrace` payloads.
    allocator: ChainAllocator<P>,
    /// Page source for the generations.
    pages: P,
}

impl CallTraceStorage<OsPageAllocator> {
    /// Creates a storage backed by OS pages, with an initial generation of
    /// 65536 slots and one arena chunk reserved up front.
    pub fn try_new() -> Result<Self, StorageError> {
        Self::try_new_in(OsPageAllocator)
    }
}

impl<P: PageAllocator + Clone> CallTraceStorage<P> {
    /// Creates a storage whose generations and arena chunks both come from
    /// `pages`.
    pub fn try_new_in(pages: P) -> Result<Self, StorageError> {
        let allocator = ChainAllocator::try_new_in(DEFAULT_CHUNK_SIZE, pages.clone())?;
        let current = Generation::allocate(&pages, ptr::null_mut(), INITIAL_CAPACITY)?;
        log::debug!("created call trace storage, initial capacity {INITIAL_CAPACITY}");
        Ok(Self {
            current: AtomicPtr::new(current.as_ptr()),
            allocator,
            pages,
        })
    }
}

impl<P: PageAllocator> CallTraceStorage<P> {
    fn current_generation(&self) -> NonNull<Generation> {
        let current = self.current.load(Ordering::Acquire);
        // SAFETY: `current` is set before the storage is usable and is
        // never null afterwards.
        unsafe { NonNull::new_unchecked(current) }
    }

    /// Interns `frames` and returns its identifier.
    ///
    /// Returns `0` ("unidentified trace") when the probe chain overflows or
    /// the payload arena is exhausted; the caller is expected to drop the
    /// sample. Identifiers are stable until [`CallTraceStorage::clear`].
    pub fn put(&self, frames: &[CallFrame]) -> u32 {
        if frames.len() > i32::MAX as usize {
            return 0;
        }
        let hash = hash::call_trace_hash(frames);

        // Work against a snapshot of the newest generation; a growth
        // published mid-call redirects only subsequent calls.
        let table = self.current_generation();
        // SAFETY: generations stay mapped until clear()/drop, which require
        // exclusive access, so the snapshot outlives this call.
        let keys = unsafe { Generation::keys(table) };
        let capacity = unsafe { Generation::capacity(table) };
        let mask = capacity - 1;
        let mut slot = (hash & u64::from(mask)) as u32;
        let mut step = 0u32;

        loop {
            let key = keys[slot as usize].load(Ordering::Acquire);
            if key == hash {
                // Already interned here, possibly by a racing winner whose
                // payload is still in flight.
                break;
            }
            if key == 0 {
                if keys[slot as usize]
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // Lost the claim; re-read the same slot. The winner's key
                    // is either this hash (a hit) or another (keep probing).
                    continue;
                }

                // Exactly one insert observes the 3/4 threshold and kicks
                // off growth. Overflow-free form of capacity * 3 / 4.
                // SAFETY: live generation, see above.
                if unsafe { Generation::inc_size(table) } == capacity / 4 * 3 {
                    self.grow(table, capacity);
                }

                // Reuse a payload interned by the previous generation
                // rather than storing a second copy.
                // SAFETY: live generation, see above.
                let prev = unsafe { Generation::prev(table) };
                let mut trace = match NonNull::new(prev) {
                    // SAFETY: older generations stay mapped as long as the
                    // newest does.
                    Some(prev) => unsafe { Generation::find(prev, hash) },
                    None => ptr::null_mut(),
                };
                if trace.is_null() {
                    trace = self.store_call_trace(frames);
                }
                // SAFETY: live generation, see above.
                (unsafe { Generation::values(table) })[slot as usize]
                    .store(trace, Ordering::Release);
                if trace.is_null() {
                    // Arena exhausted: the slot stays claimed with no
                    // payload, and the sample is dropped.
                    return 0;
                }
                break;
            }

            step += 1;
            if step >= capacity {
                // Table saturated before a growth took effect.
                return 0;
            }
            slot = (slot + step) & mask;
        }

        Generation::slot_id(capacity, slot)
    }

    /// Allocates the doubled generation and publishes it as current. The
    /// loser of the publication race frees its allocation, which was never
    /// visible to other threads. Growth is best-effort: on failure the
    /// current generation keeps serving inserts.
    fn grow(&self, table: NonNull<Generation>, capacity: u32) {
        let Some(doubled) = capacity.checked_mul(2) else {
            return;
        };
        let Ok(new_table) = Generation::allocate(&self.pages, table.as_ptr(), doubled) else {
            return;
        };
        let published = self.current.compare_exchange(
            table.as_ptr(),
            new_table.as_ptr(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if published.is_err() {
            // SAFETY: never published, so no other thread can hold it.
            unsafe { Generation::destroy(new_table, &self.pages) };
        }
    }

    fn store_call_trace(&self, frames: &[CallFrame]) -> *mut CallTrace {
        let Some(layout) = CallTrace::layout_for(frames.len()) else {
            return ptr::null_mut();
        };
        let Ok(allocation) = self.allocator.allocate(layout) else {
            return ptr::null_mut();
        };
        // SAFETY: the allocation is 8-aligned and sized per layout_for, and
        // frames.len() was bounds-checked in put.
        unsafe { CallTrace::write(allocation.cast(), frames) }.as_ptr()
    }

    /// Copies a snapshot of every interned trace into `out`, keyed by
    /// identifier. Identifier ranges of distinct generations are disjoint,
    /// so entries never collide.
    ///
    /// Claimed slots whose payload is not yet published are skipped, which
    /// makes concurrent use with `put` yield a fuzzy but safe snapshot. The
    /// returned references stay valid until [`CallTraceStorage::clear`] or
    /// drop, both of which require exclusive access.
    pub fn collect<'a>(&'a self, out: &mut BTreeMap<u32, &'a CallTrace>) {
        let mut table = NonNull::new(self.current.load(Ordering::Acquire));
        while let Some(generation) = table {
            // SAFETY: generations stay mapped while `self` is borrowed.
            let capacity = unsafe { Generation::capacity(generation) };
            let keys = unsafe { Generation::keys(generation) };
            let values = unsafe { Generation::values(generation) };
            for slot in 0..capacity {
                if keys[slot as usize].load(Ordering::Acquire) == 0 {
                    continue;
                }
                let value = values[slot as usize].load(Ordering::Acquire);
                if let Some(trace) = NonNull::new(value) {
                    // SAFETY: published payloads are immutable and outlive
                    // the borrow of `self`.
                    let trace = unsafe { &*trace.as_ptr() };
                    out.insert(Generation::slot_id(capacity, slot), trace);
                }
            }
            // SAFETY: live generation, see above.
            table = NonNull::new(unsafe { Generation::prev(generation) });
        }
    }

    /// Drops every interned trace and resets the table to its initial
    /// generation. Invalidates all previously returned identifiers.
    pub fn clear(&mut self) {
        let mut dropped = 0usize;
        // SAFETY: exclusive access: no readers or writers are live, so the
        // grown generations can be unmapped and the oldest reset in place.
        let mut table = unsafe { NonNull::new_unchecked(*self.current.get_mut()) };
        unsafe {
            while !Generation::prev(table).is_null() {
                let prev = Generation::destroy(table, &self.pages);
                table = NonNull::new_unchecked(prev);
                dropped += 1;
            }
            Generation::clear(table);
        }
        *self.current.get_mut() = table.as_ptr();
        self.allocator.clear();
        log::debug!("cleared call trace storage, dropped {dropped} grown generations");
    }

    /// Slot capacity of the newest generation.
    pub fn capacity(&self) -> u32 {
        // SAFETY: live generation; see current_generation.
        unsafe { Generation::capacity(self.current_generation()) }
    }

    /// Bytes of interned payload currently held by the arena.
    pub fn allocated_bytes(&self) -> usize {
        self.allocator.used_bytes()
    }
}

impl<P: PageAllocator> Drop for CallTraceStorage<P> {
    fn drop(&mut self) {
        let mut table = *self.current.get_mut();
        while let Some(generation) = NonNull::new(table) {
            // SAFETY: exclusive access during drop; the chain is walked
            // head to tail exactly once.
            table = unsafe { Generation::destroy(generation, &self.pages) };
        }
    }
}
