//! Thread-safe fixed-size-object memory pool backed directly by OS pages
//!
//! `pagepool` satisfies allocation requests for one object type straight
//! from OS page mappings, bypassing the global allocator:
//!
//! - Backing pages are mapped in allocation-granularity units and aligned to
//!   their own size, so all bookkeeping is recovered from an object's
//!   address. There is no per-object header, which keeps the footprint of
//!   small objects at `max(size_of::<T>(), 8)` bytes exactly.
//! - Slots are claimed through a bump-pointer/free-list hybrid: O(1)
//!   allocation and deallocation, modulo lock contention.
//! - [`MemoryPool::deallocate`] is a static function. Objects can be freed
//!   from any thread without a reference to the pool in hand.
//! - [`MemoryPool::clear`] wipes every allocation in one call.
//! - The locking discipline is pluggable: a yielding spin lock by default,
//!   [`NullLock`] to strip synchronization from single-threaded pools.
//!
//! The pool neither constructs nor destroys payloads; [`PoolBox`] layers
//! RAII value semantics on top for callers that want them.
//!
//! # Example
//!
//! ```
//! use pagepool::MemoryPool;
//!
//! let pool: MemoryPool<u64> = MemoryPool::new();
//!
//! let slot = pool.allocate().expect("out of memory");
//! // SAFETY: the slot is ours until deallocated, and `slot` came from
//! // `pool`, which is still alive.
//! unsafe {
//!     slot.as_ptr().write(7);
//!     assert_eq!(slot.as_ptr().read(), 7);
//!     MemoryPool::<u64>::deallocate(slot);
//! }
//! ```
//!
//! Or with RAII:
//!
//! ```
//! use pagepool::{MemoryPool, PoolBox};
//!
//! let pool: MemoryPool<String> = MemoryPool::new();
//! let greeting = PoolBox::new_in(String::from("hi"), &pool)?;
//! assert_eq!(greeting.len(), 2);
//! # Ok::<(), pagepool::MemoryError>(())
//! ```

#![warn(missing_docs)]

pub mod error;
pub mod lock;
pub mod platform;
pub mod pool;
pub mod utils;

pub use error::{MemoryError, Result};
pub use lock::{NullLock, RawLock, SpinLock};
pub use platform::{OsPages, PageProvider};
pub use pool::{MemoryPool, PoolBox, PoolStats};
