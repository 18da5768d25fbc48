//! The boundary toward the block-device driver.
//!
//! The cache does not speak to a concrete disk controller itself (that is
//! out of scope — see §1's Non-goals); it delegates every transfer to a
//! single `disk_rw` operation, expressed here as a trait so the cache can be
//! driven by an in-memory stand-in under test and by a real driver in a
//! kernel build, behind the same interface.

/// A synchronous block device: one `BLOCKSIZE`-byte transfer at a time.
///
/// Implementations are assumed to always succeed; this layer has no
/// `Result` to propagate, matching §7/§11's "disk I/O is infallible at this
/// layer" error model.
pub trait BlockDevice: Send + Sync {
    /// Transfer `buf.len()` bytes between `(dev, blockno)` and `buf`.
    /// Reads when `write` is `false`, writes when `write` is `true`.
    /// Returns only on completion.
    fn disk_rw(&self, dev: u32, blockno: u32, buf: &mut [u8], write: bool);
}

/// An in-memory block device, for tests and for embedding this crate
/// somewhere a real disk driver doesn't exist yet.
///
/// Every call is recorded so tests can assert on dispatch counts (how many
/// reads actually reached the "disk" versus were served from cache).
pub mod mem {
    use super::BlockDevice;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Call {
        pub dev: u32,
        pub blockno: u32,
        pub write: bool,
    }

    /// A `BlockDevice` backed by a `HashMap`, with a full call log.
    pub struct MemDisk {
        blocksize: usize,
        blocks: Mutex<HashMap<(u32, u32), Vec<u8>>>,
        calls: Mutex<Vec<Call>>,
    }

    impl MemDisk {
        pub fn new(blocksize: usize) -> Self {
            Self {
                blocksize,
                blocks: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// Number of `disk_rw` calls matching `write`, e.g. `reads()`/`writes()`.
        pub fn call_count(&self, write: bool) -> usize {
            self.calls.lock().unwrap().iter().filter(|c| c.write == write).count()
        }

        pub fn reads(&self) -> usize {
            self.call_count(false)
        }

        pub fn writes(&self) -> usize {
            self.call_count(true)
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl BlockDevice for MemDisk {
        fn disk_rw(&self, dev: u32, blockno: u32, buf: &mut [u8], write: bool) {
            self.calls.lock().unwrap().push(Call { dev, blockno, write });

            let mut blocks = self.blocks.lock().unwrap();
            if write {
                blocks.insert((dev, blockno), buf.to_vec());
            } else {
                let stored = blocks
                    .entry((dev, blockno))
                    .or_insert_with(|| vec![0u8; self.blocksize]);
                buf.copy_from_slice(stored);
            }
        }
    }
}
