//! A hashed, LRU-evicting block buffer cache: an in-memory cache of
//! fixed-size disk blocks that doubles as the synchronization point for
//! concurrent kernel threads sharing the same block.
//!
//! The cache owns a fixed pool of buffer slots distributed across hash
//! buckets, each bucket a short-lived-spinlock-guarded LRU list (`bucket`).
//! Each slot's content lives behind its own blocking sleep lock (`slot`,
//! `sleeplock`), held by a client for the duration of its use, including
//! across disk I/O. `cache` ties these together into the public
//! `get`/`read`/`write`/`release`/`pin`/`unpin` entry points a filesystem
//! layer calls; `disk` is the boundary toward the block-device driver.
//!
//! Out of scope: disk I/O itself beyond the `BlockDevice` trait boundary,
//! write-ordering policy above the cache (a filesystem journal's
//! responsibility), dynamic resizing of the pool, multi-device sharding,
//! and persistence across restarts.

mod bucket;
mod cache;
mod disk;
mod param;
mod sleeplock;
mod slot;
mod spinlock;

pub use cache::{BufferCache, BufGuard};
pub use disk::mem::MemDisk;
pub use disk::BlockDevice;
pub use param::CacheConfig;
