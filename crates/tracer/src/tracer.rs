//! Per-device tracer state.
//!
//! A [`Tracer`] owns everything attached to one traced minor: the base
//! device handle, the COW manager, the three work queues, the worker
//! threads, the sticky fail code and the submit/receive counters that gate
//! teardown. State transitions are driven by the control surface and by
//! mount events; the state word itself is a small bit set so the
//! interception path can read it without locks.

use crate::memory::MemoryProbe;
use crate::queue::{BioQueue, SsetQueue};
use blocksnap_cow::{AutoExpandManager, CowManager, COW_UUID_SIZE};
use blocksnap_core::{errno, BaseDevice, Error, Result};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Tracer is in snapshot mode (else incremental).
pub const SNAPSHOT: u32 = 1 << 0;
/// Tracer is actively intercepting writes.
pub const ACTIVE: u32 = 1 << 1;
/// Base device has not yet been verified by a matching mount.
pub const UNVERIFIED: u32 = 1 << 2;

/// Default COW section cache size when the caller passes 0.
pub const COW_MAX_MEMORY_DEFAULT: u64 = 300 * 1024 * 1024;

/// Default pre-allocation, as a percentage of the base device size, when the
/// caller passes 0.
pub const COW_FALLOCATE_PERCENTAGE_DEFAULT: u64 = 10;

/// Upper bound on waiting for in-flight read clones to drain.
pub const DRAIN_WAIT_MAX: Duration = Duration::from_millis(500);

/// A spawned worker thread and its stop flag.
pub struct WorkerHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl WorkerHandle {
    /// Pair a join handle with its stop flag.
    pub fn new(stop: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        WorkerHandle { stop, handle }
    }

    /// Request a stop, wake the worker through `wake`, and join it.
    pub fn stop_and_join(self, wake: impl Fn()) {
        self.stop.store(true, Ordering::SeqCst);
        wake();
        if self.handle.join().is_err() {
            error!("worker thread panicked during shutdown");
        }
    }
}

#[derive(Default)]
pub(crate) struct Workers {
    pub cow: Option<WorkerHandle>,
    pub forward: Option<WorkerHandle>,
    pub sset: Option<WorkerHandle>,
}

/// State for one traced device.
pub struct Tracer {
    minor: u32,
    state: AtomicU32,
    fail_code: AtomicI32,
    nomem: AtomicBool,
    base: RwLock<Option<Arc<BaseDevice>>>,
    bdev_path: RwLock<String>,
    cow_full_path: RwLock<PathBuf>,
    cow_rel_path: RwLock<PathBuf>,
    cache_size: AtomicU64,
    falloc_bytes: AtomicU64,
    cow: Mutex<Option<CowManager>>,
    cow_inode: AtomicU64,
    pub(crate) cow_bios: Arc<BioQueue>,
    pub(crate) orig_bios: Arc<BioQueue>,
    pub(crate) pending_ssets: Arc<SsetQueue>,
    submitted_cnt: AtomicU64,
    received_cnt: AtomicU64,
    pub(crate) workers: Mutex<Workers>,
    auto_expand: Arc<AutoExpandManager>,
    image_refs: AtomicUsize,
    mem_probe: MemoryProbe,
}

impl Tracer {
    /// Allocate an empty tracer for `minor`.
    pub fn new(minor: u32, mem_probe: MemoryProbe) -> Arc<Self> {
        Arc::new(Tracer {
            minor,
            state: AtomicU32::new(0),
            fail_code: AtomicI32::new(0),
            nomem: AtomicBool::new(false),
            base: RwLock::new(None),
            bdev_path: RwLock::new(String::new()),
            cow_full_path: RwLock::new(PathBuf::new()),
            cow_rel_path: RwLock::new(PathBuf::new()),
            cache_size: AtomicU64::new(0),
            falloc_bytes: AtomicU64::new(0),
            cow: Mutex::new(None),
            cow_inode: AtomicU64::new(0),
            cow_bios: Arc::new(BioQueue::new()),
            orig_bios: Arc::new(BioQueue::new()),
            pending_ssets: Arc::new(SsetQueue::new()),
            submitted_cnt: AtomicU64::new(0),
            received_cnt: AtomicU64::new(0),
            workers: Mutex::new(Workers::default()),
            auto_expand: Arc::new(AutoExpandManager::new()),
            image_refs: AtomicUsize::new(0),
            mem_probe,
        })
    }

    /// Minor number of this tracer.
    pub fn minor(&self) -> u32 {
        self.minor
    }

    /// Raw state bit word.
    pub fn state_bits(&self) -> u32 {
        self.state.load(Ordering::SeqCst)
    }

    pub(crate) fn set_state(&self, set: u32, clear: u32) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let next = (current | set) & !clear;
            match self.state.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether the tracer is in snapshot mode.
    pub fn is_snapshot(&self) -> bool {
        self.state_bits() & SNAPSHOT != 0
    }

    /// Whether the tracer is actively intercepting.
    pub fn is_active(&self) -> bool {
        self.state_bits() & ACTIVE != 0
    }

    /// Whether the base device is still unverified.
    pub fn is_unverified(&self) -> bool {
        self.state_bits() & UNVERIFIED != 0
    }

    /// Record a failure. The first code sticks; later calls are no-ops.
    pub fn set_fail_state(&self, code: i32) {
        let code = if code == 0 { -errno::EIO } else { -code.abs() };
        if self
            .fail_code
            .compare_exchange(0, code, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            error!(minor = self.minor, code, "tracer entering fail state");
        }
    }

    /// Record a memory-pressure failure, distinguishable in `info`.
    pub fn set_nomem_fail(&self) {
        self.nomem.store(true, Ordering::SeqCst);
        self.set_fail_state(-errno::ENOMEM);
    }

    /// The sticky fail code (negative errno), 0 when healthy.
    pub fn read_fail_state(&self) -> i32 {
        self.fail_code.load(Ordering::SeqCst)
    }

    /// Whether the recorded failure came from memory pressure.
    pub fn failed_from_nomem(&self) -> bool {
        self.nomem.load(Ordering::SeqCst)
    }

    /// The memory-pressure probe shared with the write path.
    pub fn mem_probe(&self) -> &MemoryProbe {
        &self.mem_probe
    }

    /// Attach the base device handle.
    pub(crate) fn set_base(&self, dev: Arc<BaseDevice>) {
        *self.bdev_path.write() = dev.path().to_string();
        *self.base.write() = Some(dev);
    }

    /// The base device, when attached.
    pub fn base(&self) -> Option<Arc<BaseDevice>> {
        self.base.read().clone()
    }

    /// Path the base device was registered under.
    pub fn bdev_path(&self) -> String {
        self.bdev_path.read().clone()
    }

    pub(crate) fn set_bdev_path(&self, path: String) {
        *self.bdev_path.write() = path;
    }

    /// Starting sector of the traced range.
    pub fn sect_off(&self) -> u64 {
        self.base.read().as_ref().map(|d| d.sect_off()).unwrap_or(0)
    }

    /// Length of the traced range in sectors.
    pub fn nr_sects(&self) -> u64 {
        self.base.read().as_ref().map(|d| d.nr_sects()).unwrap_or(0)
    }

    /// Lock the COW manager slot.
    pub fn cow_lock(&self) -> MutexGuard<'_, Option<CowManager>> {
        self.cow.lock()
    }

    /// Resolved path of the COW backing file.
    pub fn cow_full_path(&self) -> PathBuf {
        self.cow_full_path.read().clone()
    }

    /// COW path relative to its filesystem's mount point.
    pub fn cow_rel_path(&self) -> PathBuf {
        self.cow_rel_path.read().clone()
    }

    pub(crate) fn set_cow_paths(&self, full: PathBuf, rel: PathBuf) {
        *self.cow_full_path.write() = full;
        *self.cow_rel_path.write() = rel;
    }

    /// Inode of the COW backing file (0 while unknown).
    pub fn cow_inode(&self) -> Option<u64> {
        match self.cow_inode.load(Ordering::SeqCst) {
            0 => None,
            ino => Some(ino),
        }
    }

    pub(crate) fn set_cow_inode(&self, ino: u64) {
        self.cow_inode.store(ino, Ordering::SeqCst);
    }

    /// Configured cache size in bytes (0 means the default).
    pub fn cache_size(&self) -> u64 {
        self.cache_size.load(Ordering::SeqCst)
    }

    pub(crate) fn set_cache_size(&self, bytes: u64) {
        self.cache_size.store(bytes, Ordering::SeqCst);
    }

    /// Effective cache size after applying the default.
    pub fn effective_cache_size(&self) -> u64 {
        match self.cache_size() {
            0 => COW_MAX_MEMORY_DEFAULT,
            bytes => bytes,
        }
    }

    /// Pre-allocation size in bytes recorded at setup.
    pub fn falloc_bytes(&self) -> u64 {
        self.falloc_bytes.load(Ordering::SeqCst)
    }

    pub(crate) fn set_falloc_bytes(&self, bytes: u64) {
        self.falloc_bytes.store(bytes, Ordering::SeqCst);
    }

    /// The auto-expansion side-car.
    pub fn auto_expand(&self) -> &Arc<AutoExpandManager> {
        &self.auto_expand
    }

    /// Count a submitted read clone.
    pub(crate) fn inc_submitted(&self) {
        self.submitted_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Count a completed read clone.
    pub(crate) fn inc_received(&self) {
        self.received_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Whether every submitted clone has been received back.
    pub fn clones_drained(&self) -> bool {
        self.submitted_cnt.load(Ordering::SeqCst) == self.received_cnt.load(Ordering::SeqCst)
    }

    /// Yield until in-flight clones drain, bounded by [`DRAIN_WAIT_MAX`].
    pub fn wait_idle(&self) {
        let start = Instant::now();
        while !self.clones_drained() && start.elapsed() < DRAIN_WAIT_MAX {
            std::thread::yield_now();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Take a reference on the snapshot image.
    pub(crate) fn image_open(&self) {
        self.image_refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop a snapshot-image reference.
    pub(crate) fn image_close(&self) {
        self.image_refs.fetch_sub(1, Ordering::SeqCst);
    }

    /// Open handles on the snapshot image.
    pub fn image_ref_count(&self) -> usize {
        self.image_refs.load(Ordering::SeqCst)
    }

    /// Stop and join every running worker.
    pub(crate) fn stop_workers(&self) {
        let workers = {
            let mut guard = self.workers.lock();
            std::mem::take(&mut *guard)
        };

        if let Some(worker) = workers.cow {
            debug!(minor = self.minor, "stopping cow worker");
            let queue = Arc::clone(&self.cow_bios);
            worker.stop_and_join(move || queue.wake_all());
        }
        if let Some(worker) = workers.forward {
            let queue = Arc::clone(&self.orig_bios);
            worker.stop_and_join(move || queue.wake_all());
        }
        if let Some(worker) = workers.sset {
            debug!(minor = self.minor, "stopping sset worker");
            let queue = Arc::clone(&self.pending_ssets);
            worker.stop_and_join(move || queue.wake_all());
        }
    }
}

/// Observability snapshot of one tracer.
#[derive(Debug, Clone, Serialize)]
pub struct TracerInfo {
    /// Minor number.
    pub minor: u32,
    /// Raw state bits (`SNAPSHOT`, `ACTIVE`, `UNVERIFIED`).
    pub state: u32,
    /// Sticky fail code as a negative errno, 0 when healthy.
    pub error: i32,
    /// Whether the failure came from memory pressure.
    pub nomem: bool,
    /// Effective section-cache size in bytes.
    pub cache_size: u64,
    /// COW file size in bytes (0 while unverified).
    pub falloc_size: u64,
    /// Sequence id within the snapshot chain.
    pub seqid: u64,
    /// Snapshot-chain UUID.
    pub uuid: [u8; COW_UUID_SIZE],
    /// Resolved COW file path.
    pub cow_path: String,
    /// Base device path.
    pub bdev_path: String,
    /// COW file format version.
    pub version: u64,
    /// Changed blocks since the snapshot began.
    pub nr_changed_blocks: u64,
}

impl TracerInfo {
    /// Collect the current information for `tracer`.
    pub fn collect(tracer: &Tracer) -> Self {
        let mut info = TracerInfo {
            minor: tracer.minor(),
            state: tracer.state_bits(),
            error: tracer.read_fail_state(),
            nomem: tracer.failed_from_nomem(),
            cache_size: tracer.effective_cache_size(),
            falloc_size: 0,
            seqid: 0,
            uuid: [0u8; COW_UUID_SIZE],
            cow_path: tracer.cow_full_path().display().to_string(),
            bdev_path: tracer.bdev_path(),
            version: 0,
            nr_changed_blocks: 0,
        };

        if !tracer.is_unverified() {
            if let Some(cow) = tracer.cow_lock().as_ref() {
                info.falloc_size = cow.file_size();
                info.seqid = cow.seqid();
                info.uuid = cow.uuid();
                info.version = cow.version();
                info.nr_changed_blocks = cow.nr_changed_blocks();
            }
        }

        info
    }
}

/// Convert a control-surface result to the 0-or-negative-errno convention.
pub fn to_errno<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(err) => err.errno(),
    }
}

/// Map a freeze failure during a start transition; stop transitions
/// tolerate it once the device is already failing.
pub(crate) fn freeze_for_transition(tracer: &Tracer, starting: bool) -> Result<()> {
    let base = tracer
        .base()
        .ok_or_else(|| Error::NoDevice("tracer has no base device".to_string()))?;
    match base.disk().freeze() {
        Ok(()) => Ok(()),
        Err(err) if !starting && tracer.read_fail_state() != 0 => {
            debug!(minor = tracer.minor(), "freeze failed on failed device, continuing");
            drop(err);
            Ok(())
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bit_operations() {
        let tracer = Tracer::new(0, MemoryProbe::disabled());
        assert!(!tracer.is_active());

        tracer.set_state(ACTIVE | SNAPSHOT, UNVERIFIED);
        assert!(tracer.is_active());
        assert!(tracer.is_snapshot());
        assert!(!tracer.is_unverified());

        tracer.set_state(0, SNAPSHOT);
        assert!(tracer.is_active());
        assert!(!tracer.is_snapshot());
    }

    #[test]
    fn test_fail_state_is_sticky() {
        let tracer = Tracer::new(1, MemoryProbe::disabled());
        assert_eq!(tracer.read_fail_state(), 0);

        tracer.set_fail_state(-errno::EIO);
        tracer.set_fail_state(-errno::ENOMEM);
        assert_eq!(tracer.read_fail_state(), -errno::EIO);
    }

    #[test]
    fn test_nomem_fail_distinguished() {
        let tracer = Tracer::new(2, MemoryProbe::disabled());
        tracer.set_nomem_fail();
        assert_eq!(tracer.read_fail_state(), -errno::ENOMEM);
        assert!(tracer.failed_from_nomem());
    }

    #[test]
    fn test_clone_counters() {
        let tracer = Tracer::new(3, MemoryProbe::disabled());
        assert!(tracer.clones_drained());
        tracer.inc_submitted();
        assert!(!tracer.clones_drained());
        tracer.inc_received();
        assert!(tracer.clones_drained());
    }

    #[test]
    fn test_effective_cache_size_default() {
        let tracer = Tracer::new(4, MemoryProbe::disabled());
        assert_eq!(tracer.effective_cache_size(), COW_MAX_MEMORY_DEFAULT);
        tracer.set_cache_size(1024);
        assert_eq!(tracer.effective_cache_size(), 1024);
    }

    #[test]
    fn test_image_ref_counting() {
        let tracer = Tracer::new(5, MemoryProbe::disabled());
        tracer.image_open();
        tracer.image_open();
        assert_eq!(tracer.image_ref_count(), 2);
        tracer.image_close();
        assert_eq!(tracer.image_ref_count(), 1);
    }
}
