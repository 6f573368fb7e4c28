//! Block I/O request model.
//!
//! A [`Bio`] describes one request against a disk: an operation, a starting
//! sector and a list of data segments. Segments carry an optional inode tag
//! identifying the file whose page cache backs them; the write path uses the
//! tag to recognize writes that target the COW backing file itself.
//!
//! Completion is decoupled from submission: a bio may carry a
//! [`BioCompletion`] cell that hands the finished bio and its errno back to
//! whoever is waiting, which is how the snapshot image turns the worker
//! pipeline into a synchronous read.

use crate::units::{SectorRange, SECTOR_SIZE};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// The operation a bio performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioOp {
    /// Read from the device into the bio's segments.
    Read,
    /// Write the bio's segments to the device.
    Write,
    /// Discard the sector range; carries no data.
    Discard,
    /// Write zeroes over the sector range; carries no data.
    WriteZeroes,
    /// Cache flush; carries no data.
    Flush,
}

/// One data segment of a bio.
#[derive(Debug, Clone)]
pub struct BioVec {
    /// Segment payload.
    pub data: Vec<u8>,
    /// Inode id of the file whose page cache backs this segment, when known.
    pub inode: Option<u64>,
}

impl BioVec {
    /// Create a segment with no backing-file association.
    pub fn new(data: Vec<u8>) -> Self {
        BioVec { data, inode: None }
    }

    /// Create a segment backed by the page cache of `inode`.
    pub fn from_inode(data: Vec<u8>, inode: u64) -> Self {
        BioVec {
            data,
            inode: Some(inode),
        }
    }
}

/// End-of-I/O action attached to a bio.
pub enum BioEndIo {
    /// Hand the finished bio to a waiting submitter.
    Waiter(Arc<BioCompletion>),
    /// Run a callback in the completing context (the soft-IRQ analog).
    Callback(Box<dyn FnOnce(Bio, i32) + Send>),
}

/// A block I/O request.
pub struct Bio {
    /// Operation.
    pub op: BioOp,
    /// Absolute starting sector on the disk.
    pub sector: u64,
    /// Data segments, in order.
    pub vecs: Vec<BioVec>,
    /// Internal marker: skip tracing and hand straight to the original
    /// submitter. Set by the forwarding worker to avoid recursion.
    pub passthrough: bool,
    end_io: Option<BioEndIo>,
}

impl std::fmt::Debug for Bio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bio")
            .field("op", &self.op)
            .field("sector", &self.sector)
            .field("size_bytes", &self.size_bytes())
            .field("passthrough", &self.passthrough)
            .finish()
    }
}

impl Bio {
    /// Create an empty bio.
    pub fn new(op: BioOp, sector: u64) -> Self {
        Bio {
            op,
            sector,
            vecs: Vec::new(),
            passthrough: false,
            end_io: None,
        }
    }

    /// Attach a completion cell; the submitter can wait on it.
    pub fn with_completion(mut self, completion: Arc<BioCompletion>) -> Self {
        self.end_io = Some(BioEndIo::Waiter(completion));
        self
    }

    /// Attach an end-of-I/O callback.
    pub fn with_end_io(mut self, end_io: impl FnOnce(Bio, i32) + Send + 'static) -> Self {
        self.end_io = Some(BioEndIo::Callback(Box::new(end_io)));
        self
    }

    /// Append a data segment.
    pub fn push_vec(&mut self, vec: BioVec) {
        self.vecs.push(vec);
    }

    /// Total payload size in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.vecs.iter().map(|v| v.data.len() as u64).sum()
    }

    /// Payload size in sectors.
    pub fn size_sectors(&self) -> u64 {
        self.size_bytes() / SECTOR_SIZE
    }

    /// One past the last sector this bio touches.
    pub fn last_sector(&self) -> u64 {
        self.sector + self.size_sectors()
    }

    /// The sector range this bio covers.
    pub fn range(&self) -> SectorRange {
        SectorRange::new(self.sector, self.size_sectors())
    }

    /// Inclusive sector-range overlap with another bio.
    pub fn overlaps(&self, other: &Bio) -> bool {
        self.sector.max(other.sector) <= self.last_sector().min(other.last_sector())
    }

    /// True for write-direction bios.
    pub fn is_write(&self) -> bool {
        matches!(self.op, BioOp::Write | BioOp::WriteZeroes | BioOp::Discard)
    }

    /// True when any segment is backed by the given inode's page cache.
    pub fn touches_inode(&self, inode: u64) -> bool {
        self.vecs.iter().any(|v| v.inode == Some(inode))
    }

    /// Whether this bio must be preserved before the base device sees it:
    /// a write with payload whose pages do not belong to the COW backing
    /// file. Write-zeroes always qualifies; its pages are synthesized by
    /// the block layer, so the backing-file check cannot apply to them.
    pub fn needs_cow(&self, cow_inode: Option<u64>) -> bool {
        if !matches!(self.op, BioOp::Write | BioOp::WriteZeroes) || self.size_bytes() == 0 {
            return false;
        }
        if self.op == BioOp::WriteZeroes {
            return true;
        }
        match cow_inode {
            Some(ino) => !self.touches_inode(ino),
            None => true,
        }
    }

    /// Finish the bio, delivering it (and `error`, 0 for success) to the
    /// attached end-of-I/O action, if any.
    pub fn complete(mut self, error: i32) {
        match self.end_io.take() {
            Some(BioEndIo::Waiter(completion)) => completion.post(self, error),
            Some(BioEndIo::Callback(callback)) => callback(self, error),
            None => {}
        }
    }
}

/// Condvar-backed rendezvous between a bio submitter and the worker that
/// finishes the bio.
#[derive(Debug, Default)]
pub struct BioCompletion {
    slot: Mutex<Option<(Bio, i32)>>,
    done: Condvar,
}

impl BioCompletion {
    /// Create a completion cell.
    pub fn new() -> Arc<Self> {
        Arc::new(BioCompletion::default())
    }

    /// Deliver the finished bio.
    pub fn post(&self, bio: Bio, error: i32) {
        let mut slot = self.slot.lock();
        *slot = Some((bio, error));
        self.done.notify_all();
    }

    /// Block until the bio is delivered.
    pub fn wait(&self) -> (Bio, i32) {
        let mut slot = self.slot.lock();
        while slot.is_none() {
            self.done.wait(&mut slot);
        }
        slot.take().expect("completion slot populated")
    }
}

/// A contiguous run of changed sectors recorded in incremental mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorSet {
    /// First sector of the run, relative to the traced device.
    pub sect: u64,
    /// Length of the run in sectors.
    pub len: u64,
}
