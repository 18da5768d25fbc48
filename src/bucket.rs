//! A bucket: a hashed LRU list of buffer-slot metadata, behind a short
//! metadata spinlock.
//!
//! Each slot's (dev, blockno, refcount) identity lives inside whichever
//! bucket currently owns it, ordered most-recently-used first. This is an
//! intrusive doubly-linked list re-expressed by relation rather than by
//! pointer: membership is "this `SlotMeta` sits at this position in this
//! bucket's `Vec`", so there are no raw `prev`/`next` pointers (or even
//! `prev`/`next` indices) to keep consistent by hand, and a steal is just
//! removing a `SlotMeta` from one bucket's `Vec` and inserting it into
//! another's.
//!
//! Bucket sizes are small (`slot_count / bucket_count`, typically ~2-3), so
//! the linear scans `get`/`release` perform here cost what a handful of
//! pointer hops would in a pointer-linked list, without the unsafety.

use crate::spinlock::SpinLock;

/// One slot's identity and liveness, as tracked by its current bucket.
#[derive(Debug, Clone, Copy)]
pub struct SlotMeta {
    /// Index into the pool's `Slot` array — stable for the slot's lifetime.
    pub slot_index: usize,
    pub dev: u32,
    pub blockno: u32,
    pub refcnt: usize,
}

/// A bucket's LRU list: index 0 is the most-recently-used entry, the last
/// entry is the least-recently-used (the next eviction candidate).
pub type Bucket = SpinLock<Vec<SlotMeta>>;

pub fn new_bucket() -> Bucket {
    SpinLock::new(Vec::new(), "bcache_bucket")
}

/// Insert `meta` at the MRU head of `list`.
pub fn push_mru(list: &mut Vec<SlotMeta>, meta: SlotMeta) {
    list.insert(0, meta);
}
