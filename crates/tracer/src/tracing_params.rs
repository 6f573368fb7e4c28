//! Shared state between an intercepted write and its read clones.
//!
//! The original write bio must not reach the base device before every read
//! clone covering its range has been queued for preservation. The clones
//! therefore share a [`TracingParams`] record holding the original bio; the
//! last reference to drop releases the original onto the forwarding queue.

use crate::queue::BioQueue;
use blocksnap_core::Bio;
use parking_lot::Mutex;
use std::sync::Arc;

/// Reference-counted holder of the original write bio.
pub struct TracingParams {
    orig_bio: Mutex<Option<Bio>>,
    orig_queue: Arc<BioQueue>,
}

impl TracingParams {
    /// Wrap an intercepted write. Each read clone keeps one `Arc` alive
    /// until its completion handler has run.
    pub fn new(orig_queue: Arc<BioQueue>, orig_bio: Bio) -> Arc<Self> {
        Arc::new(TracingParams {
            orig_bio: Mutex::new(Some(orig_bio)),
            orig_queue,
        })
    }
}

impl Drop for TracingParams {
    fn drop(&mut self) {
        // all clones are queued; the original write may now proceed
        if let Some(bio) = self.orig_bio.lock().take() {
            self.orig_queue.add(bio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksnap_core::{BioOp, BioVec};

    fn write_bio(sector: u64) -> Bio {
        let mut bio = Bio::new(BioOp::Write, sector);
        bio.push_vec(BioVec::new(vec![0u8; 512]));
        bio
    }

    #[test]
    fn test_orig_released_on_last_drop() {
        let queue = Arc::new(BioQueue::new());
        let tp = TracingParams::new(Arc::clone(&queue), write_bio(24));

        let clone_ref = Arc::clone(&tp);
        drop(tp);
        assert!(queue.is_empty(), "orig must be held while clones remain");

        drop(clone_ref);
        let released = queue.dequeue().expect("orig released");
        assert_eq!(released.sector, 24);
    }
}
