//! A buffer slot's content half: the byte array clients read and write,
//! behind its own sleep lock, plus the `valid` flag recording whether it
//! currently holds a block's contents at all.

use crate::sleeplock::SleepLock;
use std::sync::atomic::AtomicBool;

/// The content of one cached block.
pub struct BufData {
    bytes: Vec<u8>,
}

impl BufData {
    fn new(blocksize: usize) -> Self {
        Self {
            bytes: vec![0u8; blocksize],
        }
    }
}

impl std::ops::Deref for BufData {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::ops::DerefMut for BufData {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// One pool slot's content-side state. Metadata (identity, refcount, LRU
/// position) lives separately in whichever bucket currently owns the slot
/// (see `bucket::SlotMeta`) — only the content buffer and its lock live
/// here, addressed by a stable slot index that never changes across the
/// slot's lifetime.
pub struct Slot {
    /// Has this slot's content been filled from disk since it last changed
    /// identity? Written only while the owning bucket's metadata lock is
    /// held (during a hit-miss recycle or a steal, both of which already
    /// exclude any other thread from touching this slot, since its refcount
    /// just became nonzero); read only after the content lock has been
    /// acquired by the same call path. The happens-before edge is carried
    /// by the bucket spinlock's release and the content sleep lock's
    /// acquire, so `Relaxed` ordering suffices here.
    pub valid: AtomicBool,
    pub content: SleepLock<BufData>,
}

impl Slot {
    pub fn new(blocksize: usize) -> Self {
        Self {
            valid: AtomicBool::new(false),
            content: SleepLock::new(BufData::new(blocksize), "bcache_slot_content"),
        }
    }
}
