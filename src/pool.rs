//! Allocator engine: ties size classes, a segment's free list, and
//! multi-segment chain growth together behind a single public handle.
//!
//! `MemoryPool` owns the head segment; every other segment in the chain is
//! reachable only by walking `Segment::next()`. All inherent methods take
//! `&self` (the pool is meant to be shared across threads, typically behind
//! an `Arc`), so chain growth is a single-assignment race resolved by
//! `Segment::try_attach_next`, and the error channel is the thread-local
//! slot in [`crate::error`].

use log::{info, warn};

use crate::error::{clear_last_error, set_last_error, PoolError};
use crate::segment::Segment;
use crate::types::{is_power_of_two, SegmentStats, DEFAULT_SEGMENT_SIZE, POINTER_ALIGN};

/// Configuration accepted by [`MemoryPool::create_with_config`]: pool size,
/// thread-safety flag, alignment, and the initial set of size classes.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub size: usize,
    pub thread_safe: bool,
    pub alignment: usize,
    pub size_classes: Vec<(usize, usize)>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size: DEFAULT_SEGMENT_SIZE,
            thread_safe: true,
            alignment: POINTER_ALIGN,
            size_classes: Vec::new(),
        }
    }
}

pub struct MemoryPool {
    head: Box<Segment>,
    alignment: usize,
    thread_safe: bool,
    size_classes: Vec<(usize, usize)>,
}

impl MemoryPool {
    /// Create a pool with a single segment of at least `size` usable bytes.
    pub fn create(size: usize, thread_safe: bool) -> Result<MemoryPool, PoolError> {
        Self::create_with_config(PoolConfig {
            size,
            thread_safe,
            ..PoolConfig::default()
        })
    }

    pub fn create_with_config(config: PoolConfig) -> Result<MemoryPool, PoolError> {
        if config.size == 0 || !is_power_of_two(config.alignment) {
            return Err(PoolError::InvalidSize);
        }
        for &(slot_size, _) in &config.size_classes {
            if slot_size == 0 {
                return Err(PoolError::InvalidSize);
            }
        }
        let head = Segment::new(
            config.size,
            config.alignment,
            config.thread_safe,
            &config.size_classes,
        )?;
        info!(
            "pool: created, {} usable bytes, alignment {}",
            config.size, config.alignment
        );
        Ok(MemoryPool {
            head,
            alignment: config.alignment,
            thread_safe: config.thread_safe,
            size_classes: config.size_classes,
        })
    }

    /// Consume the pool, releasing every segment's OS reservation. Equivalent
    /// to dropping the handle; kept as an explicit method for callers that
    /// want to name the destroy point rather than rely on scope exit.
    pub fn destroy(self) {
        drop(self)
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Number of segments currently chained (always ≥ 1).
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.head.next();
        while let Some(seg) = cur {
            n += 1;
            cur = seg.next();
        }
        n
    }

    fn segments(&self) -> impl Iterator<Item = &Segment> {
        let mut cur = Some(self.head.as_ref());
        core::iter::from_fn(move || {
            let seg = cur?;
            cur = seg.next();
            Some(seg)
        })
    }

    /// Grow the chain with a new segment sized `max(default_grow_size,
    /// rounded_request + overhead)` and attach it at the tail.
    /// Concurrent growers race on `try_attach_next`; the loser's segment is
    /// dropped (releasing its OS reservation) and the loser retries against
    /// whichever segment the winner attached.
    fn grow_chain(&self, min_request: usize) -> Result<&Segment, PoolError> {
        let grow_size = DEFAULT_SEGMENT_SIZE.max(min_request);
        let mut new_seg = Segment::new(grow_size, self.alignment, self.thread_safe, &self.size_classes)?;
        let mut tail = self.head.as_ref();
        loop {
            match tail.try_attach_next(new_seg) {
                Ok(()) => {
                    crate::stats::inc_grow(&tail.stats);
                    return Ok(tail.next().expect("just attached"));
                }
                Err(rejected) => {
                    new_seg = rejected;
                    tail = tail.next().expect("tail gained a next concurrently");
                }
            }
        }
    }

    fn owning_segment(&self, ptr: *const u8) -> Option<&Segment> {
        self.segments().find(|seg| seg.contains(ptr))
    }

    // -- allocation ----------------------------------------------------------

    pub fn alloc(&self, size: usize) -> *mut u8 {
        clear_last_error();
        if size == 0 {
            set_last_error(PoolError::InvalidSize);
            return core::ptr::null_mut();
        }
        match self.alloc_internal(size) {
            Ok(p) => p,
            Err(e) => {
                set_last_error(e);
                core::ptr::null_mut()
            }
        }
    }

    fn alloc_internal(&self, size: usize) -> Result<*mut u8, PoolError> {
        for seg in self.segments() {
            if let Some(p) = seg.alloc(size) {
                return Ok(p);
            }
        }
        let needed = self.head.block_size_for_payload(size);
        let seg = self.grow_chain(needed)?;
        seg.alloc(size).ok_or(PoolError::OutOfMemory)
    }

    pub fn calloc(&self, n: usize, elem_size: usize) -> *mut u8 {
        clear_last_error();
        let total = match n.checked_mul(elem_size) {
            Some(t) if t > 0 => t,
            _ => {
                set_last_error(PoolError::InvalidSize);
                return core::ptr::null_mut();
            }
        };
        let p = self.alloc(total);
        if !p.is_null() {
            unsafe { core::ptr::write_bytes(p, 0, total) };
        }
        p
    }

    pub fn alloc_aligned(&self, size: usize, align: usize) -> *mut u8 {
        clear_last_error();
        if size == 0 || !is_power_of_two(align) || align < self.alignment {
            set_last_error(PoolError::InvalidSize);
            return core::ptr::null_mut();
        }
        for seg in self.segments() {
            if let Some(p) = seg.alloc_aligned(size, align) {
                return p;
            }
        }
        let needed = self.head.block_size_for_payload(size + align);
        match self.grow_chain(needed) {
            Ok(seg) => seg.alloc_aligned(size, align).unwrap_or_else(|| {
                set_last_error(PoolError::OutOfMemory);
                core::ptr::null_mut()
            }),
            Err(e) => {
                set_last_error(e);
                core::ptr::null_mut()
            }
        }
    }

    pub fn free(&self, ptr: *mut u8) {
        clear_last_error();
        if ptr.is_null() {
            return;
        }
        match self.owning_segment(ptr) {
            Some(seg) => {
                if let Err(e) = seg.free(ptr) {
                    warn!("pool: free({ptr:p}) failed: {e}");
                    set_last_error(e);
                }
            }
            None => {
                warn!("pool: free({ptr:p}) is not within any segment");
                set_last_error(PoolError::InvalidPointer);
            }
        }
    }

    pub fn realloc(&self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        clear_last_error();
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }
        let seg = match self.owning_segment(ptr) {
            Some(seg) => seg,
            None => {
                set_last_error(PoolError::InvalidPointer);
                return core::ptr::null_mut();
            }
        };
        // Fixed-slab slots carry no boundary-tag header, so they can't be
        // grown or shrunk in place; relocate into a fresh general
        // allocation instead, the same way `alloc_fixed` never regrows a
        // slab in place.
        if let Some(slot_size) = seg.fixed_slot_size(ptr) {
            if new_size <= slot_size {
                return ptr;
            }
            let new_ptr = self.alloc(new_size);
            if new_ptr.is_null() {
                return core::ptr::null_mut();
            }
            unsafe {
                core::ptr::copy_nonoverlapping(ptr, new_ptr, slot_size.min(new_size));
            }
            self.free(ptr);
            clear_last_error();
            return new_ptr;
        }
        let old_size = match seg.live_payload_size(ptr) {
            Some(s) => s,
            None => {
                set_last_error(PoolError::InvalidPointer);
                return core::ptr::null_mut();
            }
        };
        if new_size <= old_size {
            seg.shrink_in_place(ptr, new_size);
            return ptr;
        }
        if seg.try_grow_in_place(ptr, new_size) {
            crate::stats::inc_grow(&seg.stats);
            return ptr;
        }
        let new_ptr = self.alloc(new_size);
        if new_ptr.is_null() {
            return core::ptr::null_mut();
        }
        let copy_len = old_size.min(new_size);
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, new_ptr, copy_len);
        }
        self.free(ptr);
        clear_last_error();
        new_ptr
    }

    // -- size classes ---------------------------------------------------------

    /// Register a size class on every existing segment and remember it in
    /// the pool's config snapshot so future chain-growth segments inherit it
    /// too. Takes `&mut self`: intended to be called during single-owner
    /// setup, before the pool is shared across threads.
    pub fn add_size_class(&mut self, slot_size: usize, capacity: usize) -> Option<usize> {
        if slot_size == 0 || capacity == 0 {
            set_last_error(PoolError::InvalidSize);
            return None;
        }
        let mut idx = None;
        for seg in self.segments() {
            idx = Some(seg.add_size_class(slot_size, capacity));
        }
        self.size_classes.push((slot_size, capacity));
        idx
    }

    pub fn alloc_fixed(&self, size: usize) -> *mut u8 {
        clear_last_error();
        if size == 0 {
            set_last_error(PoolError::InvalidSize);
            return core::ptr::null_mut();
        }
        for seg in self.segments() {
            if let Some(p) = seg.alloc_fixed(size) {
                return p;
            }
        }
        self.alloc(size)
    }

    pub fn free_fixed(&self, ptr: *mut u8) {
        self.free(ptr);
    }

    // -- maintenance ------------------------------------------------------

    /// Force every registered, not-yet-carved size class to carve its slab
    /// immediately rather than lazily on first `alloc_fixed`.
    pub fn warmup(&self) {
        for seg in self.segments() {
            for &(slot_size, _) in &self.size_classes {
                // Touch-and-release: forces the slab to carve without
                // leaking the probe slot.
                if let Some(p) = seg.alloc_fixed(slot_size) {
                    let _ = seg.free(p);
                }
            }
        }
    }

    pub fn defragment(&self) {
        for seg in self.segments() {
            seg.defragment();
        }
    }

    /// Reinitialize every segment to a single free block, preserving
    /// size-class configuration but clearing carved slabs. All previously
    /// returned payloads become invalid.
    pub fn reset(&self) {
        for seg in self.segments() {
            seg.reset();
        }
    }

    pub fn validate(&self) -> bool {
        self.segments().all(|seg| seg.validate())
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.owning_segment(ptr).is_some()
    }

    pub fn stats(&self, segment_index: usize) -> Option<SegmentStats> {
        self.segments().nth(segment_index).map(|s| s.stats_snapshot())
    }

    pub fn aggregate_stats(&self) -> SegmentStats {
        self.segments()
            .map(|s| s.stats_snapshot())
            .fold(SegmentStats::default(), |acc, s| acc + s)
    }
}
