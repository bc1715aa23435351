// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::trace::CallTrace;
use core::mem;
use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use crossbeam_utils::CachePadded;
use datadog_signal_alloc::{AllocError, PageAllocator};

/// Capacity of the first generation. The identifier formula is anchored to
/// this constant: a generation of capacity `c` maps slot `s` to
/// `c - (INITIAL_CAPACITY - 1) + s`, which keeps the identifier ranges of
/// successive capacity doublings disjoint and increasing.
pub(crate) const INITIAL_CAPACITY: u32 = 65536;

/// One open-addressed table generation: this header, then `capacity` keys
/// (64-bit hashes, zero means empty), then `capacity` values (trace
/// pointers), all in a single page-aligned, zero-initialized mapping.
///
/// A slot moves through exactly two transitions: a CAS on the key claims it
/// (`0 -> hash`, permanent for the generation's lifetime), then a store
/// publishes the value (`null -> trace`). Readers that observe the key may
/// still see a null value and must treat the slot as not-yet-published.
#[repr(C)]
pub(crate) struct Generation {
    /// Previous, smaller generation, or null for the oldest.
    prev: *mut Generation,
    /// Bytes in the mapping backing this generation.
    mapped: usize,
    /// Power-of-two slot count.
    capacity: u32,
    /// Claimed slots. Padded onto its own cache line so the contended
    /// counter does not thrash the read-mostly fields above.
    size: CachePadded<AtomicU32>,
}

impl Generation {
    fn bytes_for(capacity: u32) -> Result<usize, AllocError> {
        let slot = mem::size_of::<u64>() + mem::size_of::<*mut CallTrace>();
        let slots = slot.checked_mul(capacity as usize).ok_or(AllocError)?;
        mem::size_of::<Generation>()
            .checked_add(slots)
            .ok_or(AllocError)
    }

    /// Maps and initializes a generation. The zeroed mapping doubles as the
    /// empty state of every slot.
    pub(crate) fn allocate<P: PageAllocator>(
        pages: &P,
        prev: *mut Generation,
        capacity: u32,
    ) -> Result<NonNull<Generation>, AllocError> {
        debug_assert!(capacity.is_power_of_two());
        let mapping = pages.safe_alloc(Self::bytes_for(capacity)?)?;
        let this = mapping.cast::<Generation>();
        // SAFETY: the mapping is page-aligned and large enough for the
        // header; `size` is already valid as all-zero bytes.
        unsafe {
            ptr::addr_of_mut!((*this.as_ptr()).prev).write(prev);
            ptr::addr_of_mut!((*this.as_ptr()).mapped).write(mapping.len());
            ptr::addr_of_mut!((*this.as_ptr()).capacity).write(capacity);
        }
        Ok(this)
    }

    /// Unmaps `this` and returns its predecessor.
    ///
    /// # Safety
    ///
    /// `this` must be a live generation from [`Generation::allocate`] on the
    /// same pages source, and no thread may touch it afterwards.
    pub(crate) unsafe fn destroy<P: PageAllocator>(
        this: NonNull<Generation>,
        pages: &P,
    ) -> *mut Generation {
        let (prev, mapped) = {
            // SAFETY: still live at this point.
            let header = unsafe { this.as_ref() };
            (header.prev, header.mapped)
        };
        let mapping = NonNull::slice_from_raw_parts(this.cast::<u8>(), mapped);
        // SAFETY: forwarding the exact mapping returned by safe_alloc.
        unsafe { pages.safe_free(mapping) };
        prev
    }

    /// # Safety
    /// `this` must be a live generation.
    pub(crate) unsafe fn prev(this: NonNull<Generation>) -> *mut Generation {
        // SAFETY: per the caller's contract.
        unsafe { this.as_ref() }.prev
    }

    /// # Safety
    /// `this` must be a live generation.
    pub(crate) unsafe fn capacity(this: NonNull<Generation>) -> u32 {
        // SAFETY: per the caller's contract.
        unsafe { this.as_ref() }.capacity
    }

    /// # Safety
    /// `this` must be a live generation.
    pub(crate) unsafe fn size(this: NonNull<Generation>) -> u32 {
        // SAFETY: per the caller's contract.
        unsafe { this.as_ref() }.size.load(Ordering::Relaxed)
    }

    /// Atomically increments the claimed-slot count and returns the new
    /// value.
    ///
    /// # Safety
    /// `this` must be a live generation.
    pub(crate) unsafe fn inc_size(this: NonNull<Generation>) -> u32 {
        // Relaxed: the counter only drives the growth trigger; it does not
        // order slot publication.
        // SAFETY: per the caller's contract.
        unsafe { this.as_ref() }.size.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The key array, laid out right after the header.
    ///
    /// # Safety
    /// `this` must be a live generation, and it must stay live for `'a`.
    pub(crate) unsafe fn keys<'a>(this: NonNull<Generation>) -> &'a [AtomicU64] {
        // SAFETY: per the caller's contract.
        let capacity = unsafe { this.as_ref() }.capacity as usize;
        // SAFETY: the mapping covers `capacity` keys after the header, the
        // header's alignment covers AtomicU64, and any bit pattern
        // (including the initial zeroes) is a valid AtomicU64.
        unsafe {
            let base = this.as_ptr().add(1).cast::<AtomicU64>();
            slice::from_raw_parts(base, capacity)
        }
    }

    /// The value array, laid out right after the keys.
    ///
    /// # Safety
    /// `this` must be a live generation, and it must stay live for `'a`.
    pub(crate) unsafe fn values<'a>(this: NonNull<Generation>) -> &'a [AtomicPtr<CallTrace>] {
        // SAFETY: per the caller's contract.
        let capacity = unsafe { this.as_ref() }.capacity as usize;
        // SAFETY: same argument as for keys, shifted by the key array.
        unsafe {
            let keys = this.as_ptr().add(1).cast::<AtomicU64>();
            let base = keys.add(capacity).cast::<AtomicPtr<CallTrace>>();
            slice::from_raw_parts(base, capacity)
        }
    }

    /// Looks up `hash` along the triangular probe sequence.
    ///
    /// Returns null on a miss, and also for a slot that is claimed but whose
    /// payload is not yet published.
    ///
    /// # Safety
    /// `this` must be a live generation.
    pub(crate) unsafe fn find(this: NonNull<Generation>, hash: u64) -> *mut CallTrace {
        // SAFETY: per the caller's contract.
        let capacity = unsafe { Self::capacity(this) };
        let keys = unsafe { Self::keys(this) };
        let mask = capacity - 1;
        let mut slot = (hash & u64::from(mask)) as u32;
        let mut step = 0u32;

        while keys[slot as usize].load(Ordering::Acquire) != hash {
            if keys[slot as usize].load(Ordering::Acquire) == 0 {
                return ptr::null_mut();
            }
            step += 1;
            if step >= capacity {
                return ptr::null_mut();
            }
            // Step 1, 2, 3, ... visits every slot of a power-of-two table.
            slot = (slot + step) & mask;
        }

        // SAFETY: per the caller's contract.
        (unsafe { Self::values(this) })[slot as usize].load(Ordering::Acquire)
    }

    /// Zeroes every slot and resets the size.
    ///
    /// # Safety
    /// `this` must be a live generation with no concurrent readers or
    /// writers.
    pub(crate) unsafe fn clear(this: NonNull<Generation>) {
        // SAFETY: per the caller's contract.
        let capacity = unsafe { this.as_ref() }.capacity as usize;
        let slot = mem::size_of::<u64>() + mem::size_of::<*mut CallTrace>();
        // SAFETY: both arrays live right after the header; zero is the empty
        // state for each.
        unsafe {
            let keys = this.as_ptr().add(1).cast::<u8>();
            ptr::write_bytes(keys, 0, slot * capacity);
        }
        // SAFETY: per the caller's contract.
        unsafe { this.as_ref() }.size.store(0, Ordering::Relaxed);
    }

    /// Identifier of `slot` in a generation of `capacity`. Because
    /// capacities double, the ranges produced by successive generations are
    /// disjoint and strictly increasing.
    pub(crate) fn slot_id(capacity: u32, slot: u32) -> u32 {
        capacity - (INITIAL_CAPACITY - 1) + slot
    }
}
