//! Block-device model.
//!
//! The engine's environment provides a way to intercept block I/O, a way to
//! freeze and thaw a device, and a name-to-device lookup. This module models
//! that environment:
//!
//! - [`BlockStore`]: sector-addressed storage behind a disk
//! - [`Disk`]: a whole disk with a swappable submit hook and freeze/thaw
//! - [`BaseDevice`]: a partition view of a disk, with mount bookkeeping
//! - [`DiskRegistry`]: process-wide path-to-device resolution
//!
//! All bios carry absolute disk sectors; a [`BaseDevice`] contributes its
//! starting offset and length so the tracing layer can scope requests.

use crate::bio::{Bio, BioOp};
use crate::error::{Error, Result};
use crate::units::SECTOR_SIZE;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Sector-addressed storage backing a disk.
pub trait BlockStore: Send + Sync {
    /// Total number of sectors.
    fn num_sectors(&self) -> u64;

    /// Read `buf.len()` bytes starting at `sector`.
    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()>;

    /// Write `buf` starting at `sector`.
    fn write(&self, sector: u64, buf: &[u8]) -> Result<()>;
}

/// Memory-backed storage, used by tests and as the reference store.
pub struct MemStore {
    data: Mutex<Vec<u8>>,
}

impl MemStore {
    /// Create a zero-filled store of `num_sectors` sectors.
    pub fn new(num_sectors: u64) -> Self {
        MemStore {
            data: Mutex::new(vec![0u8; (num_sectors * SECTOR_SIZE) as usize]),
        }
    }

    fn check_range(&self, sector: u64, len: usize) -> Result<usize> {
        let off = (sector * SECTOR_SIZE) as usize;
        let end = off + len;
        if end > self.data.lock().len() {
            return Err(Error::Invalid(format!(
                "access beyond end of device: sector {} + {} bytes",
                sector, len
            )));
        }
        Ok(off)
    }
}

impl BlockStore for MemStore {
    fn num_sectors(&self) -> u64 {
        self.data.lock().len() as u64 / SECTOR_SIZE
    }

    fn read(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        let off = self.check_range(sector, buf.len())?;
        let data = self.data.lock();
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write(&self, sector: u64, buf: &[u8]) -> Result<()> {
        let off = self.check_range(sector, buf.len())?;
        let mut data = self.data.lock();
        data[off..off + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

/// The submit-path hook a tracer installs in front of a disk.
pub type SubmitHook = Arc<dyn Fn(&Arc<Disk>, Bio) + Send + Sync>;

static NEXT_DISK_ID: AtomicU64 = AtomicU64::new(1);

/// A whole disk: storage plus the request submission path.
pub struct Disk {
    id: u64,
    name: String,
    store: Box<dyn BlockStore>,
    hook: RwLock<Option<SubmitHook>>,
    frozen: Mutex<bool>,
    thawed: Condvar,
    fail_next_freeze: AtomicBool,
}

impl Disk {
    /// Create a disk over the given storage.
    pub fn new(name: impl Into<String>, store: Box<dyn BlockStore>) -> Arc<Self> {
        Arc::new(Disk {
            id: NEXT_DISK_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            store,
            hook: RwLock::new(None),
            frozen: Mutex::new(false),
            thawed: Condvar::new(),
            fail_next_freeze: AtomicBool::new(false),
        })
    }

    /// Unique disk id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Disk name (for logging).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total sectors on the disk.
    pub fn num_sectors(&self) -> u64 {
        self.store.num_sectors()
    }

    /// Submit a bio through the request path. Routes through the installed
    /// hook when present, otherwise executes directly against storage.
    /// Blocks while the disk is frozen.
    pub fn submit(self: &Arc<Self>, bio: Bio) {
        {
            let mut frozen = self.frozen.lock();
            while *frozen {
                self.thawed.wait(&mut frozen);
            }
        }

        let hook = self.hook.read().clone();
        match hook {
            Some(hook) => hook(self, bio),
            None => self.submit_direct(bio),
        }
    }

    /// The original submitter: execute the bio against storage and complete
    /// it. Hook implementations forward here.
    pub fn submit_direct(self: &Arc<Self>, mut bio: Bio) {
        let result = match bio.op {
            BioOp::Read => {
                let mut sector = bio.sector;
                let mut result = Ok(());
                for vec in bio.vecs.iter_mut() {
                    if let Err(err) = self.store.read(sector, &mut vec.data) {
                        result = Err(err);
                        break;
                    }
                    sector += vec.data.len() as u64 / SECTOR_SIZE;
                }
                result
            }
            BioOp::Write | BioOp::WriteZeroes => {
                let mut sector = bio.sector;
                let mut result = Ok(());
                for vec in bio.vecs.iter() {
                    if let Err(err) = self.store.write(sector, &vec.data) {
                        result = Err(err);
                        break;
                    }
                    sector += vec.data.len() as u64 / SECTOR_SIZE;
                }
                result
            }
            // no data movement to model
            BioOp::Discard | BioOp::Flush => Ok(()),
        };

        match result {
            Ok(()) => bio.complete(0),
            Err(err) => {
                warn!(disk = %self.name, error = %err, "bio failed against backing store");
                bio.complete(err.errno());
            }
        }
    }

    /// Install the tracing hook on the submit path.
    pub fn install_hook(&self, hook: SubmitHook) {
        *self.hook.write() = Some(hook);
    }

    /// Remove the tracing hook, restoring direct submission.
    pub fn clear_hook(&self) {
        *self.hook.write() = None;
    }

    /// Whether a hook is currently installed.
    pub fn has_hook(&self) -> bool {
        self.hook.read().is_some()
    }

    /// Freeze the disk: subsequent submits block until [`Disk::thaw`].
    pub fn freeze(&self) -> Result<()> {
        if self.fail_next_freeze.swap(false, Ordering::SeqCst) {
            return Err(Error::Busy(format!("failed to freeze {}", self.name)));
        }
        *self.frozen.lock() = true;
        Ok(())
    }

    /// Thaw a frozen disk, releasing blocked submitters.
    pub fn thaw(&self) {
        *self.frozen.lock() = false;
        self.thawed.notify_all();
    }

    /// Test knob: make the next [`Disk::freeze`] call fail.
    pub fn fail_next_freeze(&self) {
        self.fail_next_freeze.store(true, Ordering::SeqCst);
    }

    /// Direct storage read, bypassing the submit path.
    pub fn read_sectors(&self, sector: u64, buf: &mut [u8]) -> Result<()> {
        self.store.read(sector, buf)
    }

    /// Direct storage write, bypassing the submit path.
    pub fn write_sectors(&self, sector: u64, buf: &[u8]) -> Result<()> {
        self.store.write(sector, buf)
    }
}

/// A partition view of a disk: the unit a tracer attaches to.
pub struct BaseDevice {
    path: String,
    disk: Arc<Disk>,
    sect_off: u64,
    nr_sects: u64,
    mount: Mutex<Option<PathBuf>>,
    read_only: AtomicBool,
}

impl BaseDevice {
    /// Create a partition view. `sect_off + nr_sects` must fit on the disk.
    pub fn new(
        path: impl Into<String>,
        disk: Arc<Disk>,
        sect_off: u64,
        nr_sects: u64,
    ) -> Result<Arc<Self>> {
        if sect_off + nr_sects > disk.num_sectors() {
            return Err(Error::Invalid(format!(
                "partition [{}, {}) exceeds disk of {} sectors",
                sect_off,
                sect_off + nr_sects,
                disk.num_sectors()
            )));
        }
        Ok(Arc::new(BaseDevice {
            path: path.into(),
            disk,
            sect_off,
            nr_sects,
            mount: Mutex::new(None),
            read_only: AtomicBool::new(false),
        }))
    }

    /// Device path this view was registered under.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The disk this device lives on.
    pub fn disk(&self) -> &Arc<Disk> {
        &self.disk
    }

    /// First sector of the partition on the disk.
    pub fn sect_off(&self) -> u64 {
        self.sect_off
    }

    /// Partition length in sectors.
    pub fn nr_sects(&self) -> u64 {
        self.nr_sects
    }

    /// Identity check used when a matching mount re-verifies an unverified
    /// tracer: same disk, same extent.
    pub fn same_identity(&self, other: &BaseDevice) -> bool {
        self.disk.id() == other.disk.id()
            && self.sect_off == other.sect_off
            && self.nr_sects == other.nr_sects
    }

    /// Whether a filesystem on this device is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.mount.lock().is_some()
    }

    /// Directory the device is mounted at, when mounted.
    pub fn mount_dir(&self) -> Option<PathBuf> {
        self.mount.lock().clone()
    }

    /// Record a mount of this device at `dir`.
    pub fn set_mounted(&self, dir: impl AsRef<Path>) {
        *self.mount.lock() = Some(dir.as_ref().to_path_buf());
    }

    /// Record that this device was unmounted.
    pub fn set_unmounted(&self) {
        *self.mount.lock() = None;
    }

    /// Whether the device rejects writes.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    /// Mark the device read-only (or writable again).
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    /// Submit a bio (absolute disk sectors) through the disk's request path.
    pub fn submit(&self, bio: Bio) {
        self.disk.submit(bio);
    }
}

/// Process-wide path-to-device table.
#[derive(Default)]
pub struct DiskRegistry {
    devices: RwLock<HashMap<String, Arc<BaseDevice>>>,
}

impl DiskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        DiskRegistry::default()
    }

    /// Register a whole disk under `path` and return its device view.
    pub fn add_disk(&self, path: impl Into<String>, store: Box<dyn BlockStore>) -> Arc<BaseDevice> {
        let path = path.into();
        let disk = Disk::new(path.clone(), store);
        let nr_sects = disk.num_sectors();
        let dev =
            BaseDevice::new(path.clone(), disk, 0, nr_sects).expect("whole-disk view always fits");
        self.devices.write().insert(path, Arc::clone(&dev));
        dev
    }

    /// Register a partition of an existing disk under `path`.
    pub fn add_partition(
        &self,
        path: impl Into<String>,
        disk: Arc<Disk>,
        sect_off: u64,
        nr_sects: u64,
    ) -> Result<Arc<BaseDevice>> {
        let path = path.into();
        let dev = BaseDevice::new(path.clone(), disk, sect_off, nr_sects)?;
        self.devices.write().insert(path, Arc::clone(&dev));
        Ok(dev)
    }

    /// Resolve a device path.
    pub fn resolve(&self, path: &str) -> Result<Arc<BaseDevice>> {
        self.devices
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NoDevice(path.to_string()))
    }

    /// All registered devices.
    pub fn devices(&self) -> Vec<Arc<BaseDevice>> {
        self.devices.read().values().cloned().collect()
    }
}
