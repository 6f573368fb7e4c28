//! The read-only snapshot image device.
//!
//! Reads are turned into bios, queued for the COW worker and awaited; the
//! worker synthesizes the point-in-time view from the base device and the
//! COW store. Writes are rejected. Open handles are counted so that destroy
//! can refuse while the image is in use.

use crate::tracer::Tracer;
use blocksnap_core::{Bio, BioCompletion, BioOp, BioVec, Error, Result, SECTOR_SIZE};
use std::io;
use std::sync::Arc;

/// A handle on the snapshot image of one traced device.
pub struct SnapshotImage {
    tracer: Arc<Tracer>,
}

impl SnapshotImage {
    pub(crate) fn open(tracer: Arc<Tracer>) -> Self {
        tracer.image_open();
        SnapshotImage { tracer }
    }

    /// Minor number of the underlying tracer.
    pub fn minor(&self) -> u32 {
        self.tracer.minor()
    }

    /// Image capacity in sectors (the base device's size at attach time).
    pub fn nr_sects(&self) -> u64 {
        self.tracer.nr_sects()
    }

    /// Read `buf.len()` bytes starting at `sector` (image-relative) from
    /// the point-in-time view.
    pub fn read_at(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        if self.tracer.read_fail_state() != 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "snapshot device in fail state",
            )));
        }
        if !self.tracer.is_snapshot() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "snapshot image is detached",
            )));
        }
        if !self.tracer.is_active() {
            return Err(Error::Busy("snapshot device is not active".to_string()));
        }
        if buf.len() as u64 % SECTOR_SIZE != 0 {
            return Err(Error::Invalid(format!(
                "unaligned snapshot read of {} bytes",
                buf.len()
            )));
        }
        if sector + buf.len() as u64 / SECTOR_SIZE > self.nr_sects() {
            return Err(Error::Invalid(format!(
                "snapshot read beyond device end at sector {}",
                sector
            )));
        }

        let completion = BioCompletion::new();
        let mut bio = Bio::new(BioOp::Read, sector).with_completion(Arc::clone(&completion));
        bio.push_vec(BioVec::new(vec![0u8; buf.len()]));
        self.tracer.cow_bios.add(bio);

        let (bio, err) = completion.wait();
        if err != 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::Other,
                "snapshot read failed",
            )));
        }

        buf.copy_from_slice(&bio.vecs[0].data);
        Ok(())
    }

    /// The image is read-only; every write is rejected.
    pub fn write_at(&self, _sector: u64, _buf: &[u8]) -> Result<()> {
        Err(Error::NotSupported(
            "snapshot image is read-only".to_string(),
        ))
    }
}

impl Drop for SnapshotImage {
    fn drop(&mut self) {
        self.tracer.image_close();
    }
}
