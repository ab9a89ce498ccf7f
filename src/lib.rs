//! A thread-safe arena allocator built from OS-backed segments, each
//! holding a coalescing boundary-tag free list and optional size-class
//! slabs for fast fixed-size allocation.
//!
//! ```no_run
//! use arena_pool::MemoryPool;
//!
//! let pool = MemoryPool::create(16 * 1024 * 1024, true).unwrap();
//! let p = pool.alloc(1024);
//! assert!(!p.is_null());
//! pool.free(p);
//! assert!(pool.validate());
//! ```
//!
//! Allocating and freeing mirror a C-style allocator's contract rather than
//! Rust's usual `Result`-returning APIs: operations that can fail return a
//! null pointer and record the reason in a thread-local slot retrieved with
//! [`last_error`]. This is deliberate, matching the raw-allocator contract
//! this crate's operations stand in for.
//!
//! A raw FFI veneer exposing this engine to C callers is not part of this
//! crate.

mod error;
mod os;
mod pool;
mod segment;
mod sizeclass;
mod stats;
mod types;

pub use error::{last_error, PoolError};
pub use pool::{MemoryPool, PoolConfig};
pub use types::SegmentStats;
