//! Bounded work queues between the interception path and the workers.
//!
//! Three queues exist per traced device: bios bound for the COW worker,
//! original write bios awaiting release to the base device, and sector sets
//! bound for the incremental worker. Each is a FIFO behind a mutex with a
//! condvar for the worker's sleep/wake discipline; enqueue may happen from
//! the end-of-read callback context, dequeue never blocks.

use blocksnap_core::{Bio, SectorSet};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// FIFO of bios with wake/sleep support.
#[derive(Default)]
pub struct BioQueue {
    bios: Mutex<VecDeque<Bio>>,
    event: Condvar,
}

impl BioQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        BioQueue::default()
    }

    /// Whether the queue currently holds no bios.
    pub fn is_empty(&self) -> bool {
        self.bios.lock().is_empty()
    }

    /// Append a bio and wake one waiting worker.
    pub fn add(&self, bio: Bio) {
        self.bios.lock().push_back(bio);
        self.event.notify_all();
    }

    /// Pop the head, if any. Never blocks.
    pub fn dequeue(&self) -> Option<Bio> {
        self.bios.lock().pop_front()
    }

    /// Pop the head but keep snapshot reads behind writes they overlap:
    /// when the head is a read and some queued write covers part of its
    /// range, that write takes the head's place and is returned instead.
    pub fn dequeue_delay_read(&self) -> Option<Bio> {
        let mut bios = self.bios.lock();
        let head = bios.pop_front()?;

        if !head.is_write() {
            if let Some(idx) = bios
                .iter()
                .position(|bio| bio.is_write() && bio.overlaps(&head))
            {
                let write = bios.remove(idx).expect("index from position");
                bios.insert(idx, head);
                return Some(write);
            }
        }

        Some(head)
    }

    /// Park until the queue is nonempty or the timeout elapses. Returns
    /// whether the queue is nonempty.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let mut bios = self.bios.lock();
        if bios.is_empty() {
            self.event.wait_for(&mut bios, timeout);
        }
        !bios.is_empty()
    }

    /// Wake all parked workers (used on stop requests).
    pub fn wake_all(&self) {
        self.event.notify_all();
    }
}

/// FIFO of sector sets with the same discipline as [`BioQueue`].
#[derive(Default)]
pub struct SsetQueue {
    ssets: Mutex<VecDeque<SectorSet>>,
    event: Condvar,
}

impl SsetQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        SsetQueue::default()
    }

    /// Whether the queue currently holds no sector sets.
    pub fn is_empty(&self) -> bool {
        self.ssets.lock().is_empty()
    }

    /// Append a sector set and wake one waiting worker.
    pub fn add(&self, sset: SectorSet) {
        self.ssets.lock().push_back(sset);
        self.event.notify_all();
    }

    /// Pop the head, if any.
    pub fn dequeue(&self) -> Option<SectorSet> {
        self.ssets.lock().pop_front()
    }

    /// Park until the queue is nonempty or the timeout elapses.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let mut ssets = self.ssets.lock();
        if ssets.is_empty() {
            self.event.wait_for(&mut ssets, timeout);
        }
        !ssets.is_empty()
    }

    /// Wake all parked workers.
    pub fn wake_all(&self) {
        self.event.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksnap_core::{BioOp, BioVec};

    fn bio(op: BioOp, sector: u64, bytes: usize) -> Bio {
        let mut bio = Bio::new(op, sector);
        bio.push_vec(BioVec::new(vec![0u8; bytes]));
        bio
    }

    #[test]
    fn test_fifo_order() {
        let queue = BioQueue::new();
        queue.add(bio(BioOp::Write, 0, 512));
        queue.add(bio(BioOp::Write, 8, 512));

        assert_eq!(queue.dequeue().unwrap().sector, 0);
        assert_eq!(queue.dequeue().unwrap().sector, 8);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_delay_read_promotes_overlapping_write() {
        let queue = BioQueue::new();
        queue.add(bio(BioOp::Read, 0, 4096));
        queue.add(bio(BioOp::Write, 100, 512));
        queue.add(bio(BioOp::Write, 4, 4096));

        // the overlapping write at sector 4 jumps the read
        let first = queue.dequeue_delay_read().unwrap();
        assert!(first.is_write());
        assert_eq!(first.sector, 4);

        // the non-overlapping write keeps its place behind the read
        let second = queue.dequeue_delay_read().unwrap();
        assert_eq!(second.op, BioOp::Read);
        let third = queue.dequeue_delay_read().unwrap();
        assert_eq!(third.sector, 100);
    }

    #[test]
    fn test_delay_read_leaves_reads_without_conflict() {
        let queue = BioQueue::new();
        queue.add(bio(BioOp::Read, 0, 4096));
        queue.add(bio(BioOp::Write, 64, 512));

        let first = queue.dequeue_delay_read().unwrap();
        assert_eq!(first.op, BioOp::Read);
    }

    #[test]
    fn test_wait_nonempty_sees_enqueue() {
        let queue = std::sync::Arc::new(BioQueue::new());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            std::thread::spawn(move || queue.wait_nonempty(Duration::from_secs(5)))
        };

        std::thread::sleep(Duration::from_millis(10));
        queue.add(bio(BioOp::Write, 0, 512));
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_sset_queue_round_trip() {
        let queue = SsetQueue::new();
        assert!(queue.is_empty());
        queue.add(SectorSet { sect: 8, len: 16 });
        assert!(!queue.is_empty());

        let sset = queue.dequeue().unwrap();
        assert_eq!(sset.sect, 8);
        assert_eq!(sset.len, 16);
        assert!(queue.dequeue().is_none());
    }
}
