//! Tunable parameters for the buffer cache (§6, §12 of the design this
//! crate implements: pool size, bucket count, and block size).

/// Construction-time tunables for a [`crate::BufferCache`].
///
/// There is no env-var or CLI surface for these: the cache is an in-process
/// library embedded by a kernel (or, here, by a test harness), not a
/// standalone program with external configuration inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Number of buffer slots preallocated in the pool.
    pub slot_count: usize,
    /// Number of hash buckets slots are distributed across.
    ///
    /// `blockno % bucket_count` selects a slot's home bucket, so this
    /// should be prime and coprime with the block-number strides a real
    /// filesystem produces, to keep bucket occupancy even.
    pub bucket_count: usize,
    /// Size in bytes of each slot's content buffer.
    pub blocksize: usize,
}

impl CacheConfig {
    pub const fn new(slot_count: usize, bucket_count: usize, blocksize: usize) -> Self {
        Self {
            slot_count,
            bucket_count,
            blocksize,
        }
    }
}

/// `N = 30`, `B = 13`, `BLOCKSIZE = 4096`: a pool that comfortably outlives
/// the pinned-block footprint of a handful of concurrent filesystem
/// transactions, hashed across a bucket count that is both prime and small
/// enough that a single steal rarely has to scan more than a few buckets.
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slot_count: 30,
            bucket_count: 13,
            blocksize: 4096,
        }
    }
}
