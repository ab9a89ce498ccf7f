//! Size-class slab fast path.
//!
//! Each [`SizeClass`] owns a singly linked LIFO free chain of fixed-size
//! slots, carved out of a segment's general free list on first use and
//! classified by address range rather than by a per-slot header — a
//! dedicated address subrange keeps individual slots header-free. Slots
//! are never coalesced and never placed on the segment's free list.

use crate::types::SizeClass;

/// The only bookkeeping a free slot carries: a pointer to the next free
/// slot, written into the slot's own (otherwise unused) payload.
#[repr(C)]
struct SlotLink {
    next: *mut SlotLink,
}

impl SizeClass {
    /// Thread every slot in `[slab_base, slab_base + slab_len)` onto the
    /// LIFO free chain. Called once, immediately after the backing slab is
    /// carved from the segment's free list.
    ///
    /// # Safety
    /// `slab_base..slab_base + slab_len` must be valid, exclusively owned
    /// memory, and `slab_len` must be an exact multiple of `slot_size`.
    pub unsafe fn thread_slots(&mut self) {
        debug_assert_eq!(self.slab_len % self.slot_size, 0);
        let count = self.slab_len / self.slot_size;
        self.free_head = core::ptr::null_mut();
        // Thread in reverse so the chain pops in ascending address order;
        // this has no semantic importance but makes debugging predictable.
        for i in (0..count).rev() {
            let slot = unsafe { self.slab_base.add(i * self.slot_size) };
            let link = slot as *mut SlotLink;
            unsafe {
                (*link).next = self.free_head as *mut SlotLink;
            }
            self.free_head = slot;
        }
    }

    /// Pop a free slot, or `None` if the class's slab is exhausted (the
    /// caller falls back to general `alloc`; slabs never grow).
    pub fn pop(&mut self) -> Option<*mut u8> {
        if self.free_head.is_null() {
            return None;
        }
        let slot = self.free_head;
        let link = slot as *mut SlotLink;
        self.free_head = unsafe { (*link).next } as *mut u8;
        self.in_use += 1;
        Some(slot)
    }

    /// Push a slot back onto the free chain. Caller must have already
    /// confirmed the slot belongs to this class (via [`SizeClass::contains`]).
    ///
    /// # Safety
    /// `slot` must be a slot-sized, slot-aligned pointer within this
    /// class's slab that is not already on the free chain.
    pub unsafe fn push(&mut self, slot: *mut u8) {
        let link = slot as *mut SlotLink;
        unsafe {
            (*link).next = self.free_head as *mut SlotLink;
        }
        self.free_head = slot;
        self.in_use = self.in_use.saturating_sub(1);
    }

    /// Whether `size` fits this class's slots.
    #[inline]
    pub fn fits(&self, size: usize) -> bool {
        size <= self.slot_size
    }
}
