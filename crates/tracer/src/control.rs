//! Control surface: the device table and the per-minor lifecycle
//! operations.
//!
//! One [`Controller`] owns the minor-to-tracer table. State-mutating
//! operations serialize on a single control mutex; the interception path
//! only takes the table's read side. Every transition that installs or
//! removes the submit hook is bracketed by a freeze/thaw of the base
//! device; a freeze failure aborts a start transition and is tolerated on a
//! stop once the device is already failing.

use crate::hooks::HookRegistry;
use crate::image::SnapshotImage;
use crate::intercept::tracing_fn;
use crate::memory::MemoryProbe;
use crate::tracer::{
    freeze_for_transition, Tracer, TracerInfo, ACTIVE, COW_FALLOCATE_PERCENTAGE_DEFAULT, SNAPSHOT,
    UNVERIFIED,
};
use crate::worker::{spawn_cow_worker, spawn_forward_worker, spawn_sset_worker};
use blocksnap_core::{
    mib_to_bytes, BaseDevice, Bio, DiskRegistry, Error, Result, SubmitHook, COW_SECTION_SIZE,
    SECTOR_SIZE,
};
use blocksnap_cow::{CowManager, SpaceInfo};
use parking_lot::{Mutex, RwLock};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Default number of supported minors.
pub const MAX_SNAP_DEVICES: usize = 24;

/// Process-wide minor-to-tracer table.
///
/// Interception iterates the read side; control operations mutate slots
/// under the controller's mutex.
pub struct DeviceTable {
    slots: RwLock<Vec<Option<Arc<Tracer>>>>,
}

impl DeviceTable {
    fn new(max_minors: usize) -> Self {
        DeviceTable {
            slots: RwLock::new((0..max_minors).map(|_| None).collect()),
        }
    }

    /// Tracer registered at `minor`, if any.
    pub fn get(&self, minor: u32) -> Option<Arc<Tracer>> {
        self.slots.read().get(minor as usize).cloned().flatten()
    }

    fn set(&self, minor: u32, tracer: Arc<Tracer>) {
        self.slots.write()[minor as usize] = Some(tracer);
    }

    fn clear(&self, minor: u32) {
        self.slots.write()[minor as usize] = None;
    }

    /// All registered tracers.
    pub fn tracers(&self) -> Vec<Arc<Tracer>> {
        self.slots.read().iter().flatten().cloned().collect()
    }

    /// Lowest unallocated minor.
    pub fn free_minor(&self) -> Result<u32> {
        self.slots
            .read()
            .iter()
            .position(|slot| slot.is_none())
            .map(|idx| idx as u32)
            .ok_or_else(|| Error::NotFound("no free minor available".to_string()))
    }

    /// Find the active tracer whose traced range intersects `bio` on the
    /// given disk.
    pub(crate) fn find_tracer_for(&self, disk_id: u64, bio: &Bio) -> Option<Arc<Tracer>> {
        for tracer in self.slots.read().iter().flatten() {
            if tracer.is_unverified() || !tracer.is_active() {
                continue;
            }
            let Some(base) = tracer.base() else { continue };
            if base.disk().id() != disk_id {
                continue;
            }

            let start = base.sect_off();
            let end = start + base.nr_sects();
            if bio.sector < end && bio.last_sector() > start {
                return Some(Arc::clone(tracer));
            }
        }
        None
    }
}

/// Per-path free-space probe installed by the host environment.
pub type PathSpaceProbe = Arc<dyn Fn(&Path) -> Option<SpaceInfo> + Send + Sync>;

/// The engine's control plane.
pub struct Controller {
    registry: Arc<DiskRegistry>,
    table: Arc<DeviceTable>,
    hooks: Arc<HookRegistry>,
    control_lock: Mutex<()>,
    mem_probe: MemoryProbe,
    space_probe: RwLock<Option<PathSpaceProbe>>,
}

impl Controller {
    /// Create a controller over the given device registry with the default
    /// table size and the system memory probe.
    pub fn new(registry: Arc<DiskRegistry>) -> Self {
        Controller::with_probes(registry, MAX_SNAP_DEVICES, MemoryProbe::system())
    }

    /// Create a controller with explicit limits and memory probe.
    pub fn with_probes(
        registry: Arc<DiskRegistry>,
        max_minors: usize,
        mem_probe: MemoryProbe,
    ) -> Self {
        Controller {
            registry,
            table: Arc::new(DeviceTable::new(max_minors)),
            hooks: Arc::new(HookRegistry::new()),
            control_lock: Mutex::new(()),
            mem_probe,
            space_probe: RwLock::new(None),
        }
    }

    /// Install the free-space probe used by auto-expansion.
    pub fn set_space_probe(&self, probe: PathSpaceProbe) {
        *self.space_probe.write() = Some(probe);
    }

    /// The minor-to-tracer table (read-side observability).
    pub fn table(&self) -> &Arc<DeviceTable> {
        &self.table
    }

    fn verify_minor_available(&self, minor: u32) -> Result<()> {
        if minor as usize >= self.table.slots.read().len() {
            return Err(Error::Invalid(format!("minor {} out of range", minor)));
        }
        if self.table.get(minor).is_some() {
            return Err(Error::Busy(format!("minor {} already in use", minor)));
        }
        Ok(())
    }

    fn tracer_in_use(&self, minor: u32) -> Result<Arc<Tracer>> {
        self.table
            .get(minor)
            .ok_or_else(|| Error::NoDevice(format!("no tracer on minor {}", minor)))
    }

    fn already_traced(&self, base: &BaseDevice) -> bool {
        self.table.tracers().iter().any(|tracer| {
            if tracer.is_unverified() {
                return false;
            }
            match tracer.base() {
                Some(existing) => {
                    existing.disk().id() == base.disk().id()
                        && existing.sect_off() < base.sect_off() + base.nr_sects()
                        && base.sect_off() < existing.sect_off() + existing.nr_sects()
                }
                None => false,
            }
        })
    }

    fn make_hook(&self) -> SubmitHook {
        let table = Arc::clone(&self.table);
        Arc::new(move |disk, bio| tracing_fn(&table, disk, bio))
    }

    fn install_tracing(&self, tracer: &Arc<Tracer>, base: &Arc<BaseDevice>) -> Result<()> {
        freeze_for_transition(tracer, true)?;
        self.hooks.acquire(base.disk(), self.make_hook());
        base.disk().thaw();
        Ok(())
    }

    fn remove_tracing(&self, tracer: &Arc<Tracer>, base: &Arc<BaseDevice>) {
        if freeze_for_transition(tracer, false).is_err() {
            warn!(minor = tracer.minor(), "freeze failed while removing tracing");
        }
        self.hooks.release(base.disk());
        base.disk().thaw();
    }

    fn start_snap_workers(&self, tracer: &Arc<Tracer>) {
        let mut workers = tracer.workers.lock();
        workers.cow = Some(spawn_cow_worker(Arc::clone(tracer)));
        workers.forward = Some(spawn_forward_worker(Arc::clone(tracer)));
    }

    fn start_inc_workers(&self, tracer: &Arc<Tracer>) {
        let mut workers = tracer.workers.lock();
        workers.sset = Some(spawn_sset_worker(Arc::clone(tracer)));
        workers.forward = Some(spawn_forward_worker(Arc::clone(tracer)));
    }

    fn attach_expansion(&self, tracer: &Arc<Tracer>, cow: &mut CowManager) {
        let probe = self.space_probe.read().clone();
        let path = cow.path().to_path_buf();
        cow.set_auto_expand(
            Arc::clone(tracer.auto_expand()),
            Box::new(move || probe.as_ref().and_then(|probe| probe(&path))),
        );
    }

    fn record_cow_file(
        &self,
        tracer: &Arc<Tracer>,
        base: &BaseDevice,
        cow_path: &Path,
    ) -> Result<()> {
        let rel = match base.mount_dir() {
            Some(dir) => cow_path
                .strip_prefix(&dir)
                .map(Path::to_path_buf)
                .unwrap_or_else(|_| cow_path.to_path_buf()),
            None => cow_path.to_path_buf(),
        };
        tracer.set_cow_paths(cow_path.to_path_buf(), rel);

        let metadata = std::fs::metadata(cow_path)?;
        tracer.set_cow_inode(metadata.ino());
        Ok(())
    }

    /// Set up snapshot tracing on `minor`.
    ///
    /// With the base device mounted this goes straight to
    /// `ACTIVE|SNAPSHOT`: a fresh COW file (new UUID, seqid 1), the
    /// snapshot image, the COW worker and the interception hook. Unmounted,
    /// the tracer waits in `UNVERIFIED|SNAPSHOT` for the matching mount;
    /// `cow_path` is then relative to the future mount point.
    pub fn setup_snapshot(
        &self,
        minor: u32,
        bdev_path: &str,
        cow_path: &str,
        falloc_mib: u64,
        cache_bytes: u64,
    ) -> Result<()> {
        let _guard = self.control_lock.lock();
        info!(minor, bdev_path, cow_path, "setting up snapshot");

        self.verify_minor_available(minor)?;
        let base = self.registry.resolve(bdev_path)?;
        if base.is_read_only() {
            return Err(Error::ReadOnly(bdev_path.to_string()));
        }
        if self.already_traced(&base) {
            return Err(Error::Busy(format!("{} is already being traced", bdev_path)));
        }

        let tracer = Tracer::new(minor, self.mem_probe.clone());
        tracer.set_bdev_path(bdev_path.to_string());
        tracer.set_cache_size(cache_bytes);

        if base.is_mounted() {
            tracer.set_state(ACTIVE | SNAPSHOT, UNVERIFIED);
            if let Err(err) = self.setup_active_snap(&tracer, &base, Path::new(cow_path), falloc_mib, None, 1)
            {
                self.teardown_partial(&tracer);
                return Err(err);
            }
        } else {
            tracer.set_state(SNAPSHOT | UNVERIFIED, ACTIVE);
            tracer.set_cow_paths(PathBuf::from(cow_path), PathBuf::from(cow_path));
        }

        self.table.set(minor, tracer);
        Ok(())
    }

    fn setup_active_snap(
        &self,
        tracer: &Arc<Tracer>,
        base: &Arc<BaseDevice>,
        cow_path: &Path,
        falloc_mib: u64,
        uuid: Option<[u8; 16]>,
        seqid: u64,
    ) -> Result<()> {
        tracer.set_base(Arc::clone(base));

        let falloc_bytes = if falloc_mib == 0 {
            base.nr_sects() * SECTOR_SIZE * COW_FALLOCATE_PERCENTAGE_DEFAULT / 100
        } else {
            mib_to_bytes(falloc_mib)
        };
        tracer.set_falloc_bytes(falloc_bytes);

        let mut cow = CowManager::init(
            cow_path,
            base.nr_sects(),
            COW_SECTION_SIZE,
            tracer.effective_cache_size(),
            falloc_bytes,
            uuid,
            seqid,
        )?;
        self.attach_expansion(tracer, &mut cow);
        *tracer.cow_lock() = Some(cow);
        self.record_cow_file(tracer, base, cow_path)?;

        self.start_snap_workers(tracer);
        self.install_tracing(tracer, base)?;
        Ok(())
    }

    fn teardown_partial(&self, tracer: &Arc<Tracer>) {
        tracer.stop_workers();
        if let Some(mut cow) = tracer.cow_lock().take() {
            cow.free_members();
        }
    }

    /// Register an unverified snapshot reload: the base device must not be
    /// mounted; tracing starts on its next mount.
    pub fn reload_snapshot(
        &self,
        minor: u32,
        bdev_path: &str,
        cow_path: &str,
        cache_bytes: u64,
    ) -> Result<()> {
        self.reload_unverified(minor, bdev_path, cow_path, cache_bytes, true)
    }

    /// Register an unverified incremental reload.
    pub fn reload_incremental(
        &self,
        minor: u32,
        bdev_path: &str,
        cow_path: &str,
        cache_bytes: u64,
    ) -> Result<()> {
        self.reload_unverified(minor, bdev_path, cow_path, cache_bytes, false)
    }

    fn reload_unverified(
        &self,
        minor: u32,
        bdev_path: &str,
        cow_path: &str,
        cache_bytes: u64,
        snapshot: bool,
    ) -> Result<()> {
        let _guard = self.control_lock.lock();
        info!(minor, bdev_path, cow_path, snapshot, "reloading unverified");

        self.verify_minor_available(minor)?;
        let base = self.registry.resolve(bdev_path)?;
        if base.is_mounted() {
            return Err(Error::Busy(format!(
                "{} is mounted, reload requires an unmounted device",
                bdev_path
            )));
        }

        let tracer = Tracer::new(minor, self.mem_probe.clone());
        tracer.set_bdev_path(bdev_path.to_string());
        tracer.set_cache_size(cache_bytes);
        tracer.set_base(Arc::clone(&base));
        tracer.set_cow_paths(PathBuf::from(cow_path), PathBuf::from(cow_path));
        if snapshot {
            tracer.set_state(SNAPSHOT | UNVERIFIED, ACTIVE);
        } else {
            tracer.set_state(UNVERIFIED, ACTIVE | SNAPSHOT);
        }

        self.table.set(minor, tracer);
        Ok(())
    }

    /// Tear down `minor`. Fails with busy while snapshot-image handles are
    /// open; succeeds even in the fail state.
    pub fn destroy(&self, minor: u32) -> Result<()> {
        let _guard = self.control_lock.lock();
        let tracer = self.tracer_in_use(minor)?;
        info!(minor, "destroying tracer");

        if tracer.image_ref_count() > 0 {
            return Err(Error::Busy(format!(
                "snapshot image on minor {} has open handles",
                minor
            )));
        }

        if let Some(base) = tracer.base() {
            if !tracer.is_unverified() {
                self.remove_tracing(&tracer, &base);
            }
        }
        tracer.stop_workers();

        if let Some(mut cow) = tracer.cow_lock().take() {
            if tracer.read_fail_state() != 0 {
                cow.free_members();
            } else if tracer.is_active() {
                if let Err(err) = cow.sync_and_free() {
                    warn!(minor, error = %err, "error closing cow manager during destroy");
                }
            }
        }

        self.table.clear(minor);
        Ok(())
    }

    /// `ACTIVE|SNAPSHOT -> ACTIVE|!SNAPSHOT`: stop the snapshot workers,
    /// truncate the COW file to header + index, start the sector-set
    /// worker. The snapshot image detaches; its reads fail afterwards.
    pub fn transition_to_incremental(&self, minor: u32) -> Result<()> {
        let _guard = self.control_lock.lock();
        let tracer = self.tracer_in_use(minor)?;
        info!(minor, "transitioning to incremental");

        if !tracer.is_active() || !tracer.is_snapshot() {
            return Err(Error::Busy(format!(
                "minor {} is not an active snapshot",
                minor
            )));
        }
        if tracer.read_fail_state() != 0 {
            return Err(Error::Busy(format!(
                "cannot transition minor {} in fail state",
                minor
            )));
        }

        tracer.wait_idle();
        tracer.stop_workers();

        // worker shutdown may have tripped the fail state; the incremental
        // side still starts so queued work is drained and freed
        let fail = tracer.read_fail_state();

        if let Err(err) = freeze_for_transition(&tracer, true) {
            tracer.set_fail_state(err.errno());
            return Err(err);
        }
        tracer.set_state(0, SNAPSHOT);
        if let Some(base) = tracer.base() {
            base.disk().thaw();
        }

        {
            let mut guard = tracer.cow_lock();
            if let Some(cow) = guard.as_mut() {
                cow.clear_auto_expand();
                if let Err(err) = cow.truncate_to_index() {
                    warn!(
                        minor,
                        error = %err,
                        "cow file truncation failed, incremental will use more disk space than needed"
                    );
                }
            }
        }

        self.start_inc_workers(&tracer);

        if fail != 0 {
            tracer.set_fail_state(fail);
            return Err(Error::from_errno(fail));
        }
        Ok(())
    }

    /// `ACTIVE|!SNAPSHOT -> ACTIVE|SNAPSHOT`: create a new COW file
    /// inheriting the chain UUID with `seqid + 1`, swap workers, then
    /// finalize the old file with a clean close.
    pub fn transition_to_snapshot(
        &self,
        minor: u32,
        cow_path: &str,
        falloc_mib: u64,
    ) -> Result<()> {
        let _guard = self.control_lock.lock();
        let tracer = self.tracer_in_use(minor)?;
        info!(minor, cow_path, "transitioning to snapshot");

        if !tracer.is_active() || tracer.is_snapshot() {
            return Err(Error::Busy(format!(
                "minor {} is not in active incremental mode",
                minor
            )));
        }
        if tracer.read_fail_state() != 0 {
            return Err(Error::Busy(format!(
                "cannot transition minor {} in fail state",
                minor
            )));
        }

        let base = tracer
            .base()
            .ok_or_else(|| Error::NoDevice(format!("minor {} has no base device", minor)))?;

        let (uuid, seqid) = {
            let guard = tracer.cow_lock();
            let cow = guard
                .as_ref()
                .ok_or_else(|| Error::Invalid("no cow manager to transition".to_string()))?;
            (cow.uuid(), cow.seqid())
        };

        let falloc_bytes = if falloc_mib == 0 {
            tracer.falloc_bytes()
        } else {
            mib_to_bytes(falloc_mib)
        };
        tracer.set_falloc_bytes(falloc_bytes);

        let mut new_cow = CowManager::init(
            Path::new(cow_path),
            base.nr_sects(),
            COW_SECTION_SIZE,
            tracer.effective_cache_size(),
            falloc_bytes,
            Some(uuid),
            seqid + 1,
        )?;
        self.attach_expansion(&tracer, &mut new_cow);

        tracer.stop_workers();

        if let Err(err) = freeze_for_transition(&tracer, true) {
            tracer.set_fail_state(err.errno());
            return Err(err);
        }
        let old_cow = tracer.cow_lock().replace(new_cow);
        tracer.set_state(SNAPSHOT, 0);
        base.disk().thaw();

        self.record_cow_file(&tracer, &base, Path::new(cow_path))?;
        self.start_snap_workers(&tracer);

        if let Some(old) = old_cow {
            if let Err(err) = old.sync_and_free() {
                warn!(minor, error = %err, "error finalizing previous cow file");
            }
        }
        Ok(())
    }

    /// Adjust the allowed in-memory section cache.
    pub fn reconfigure(&self, minor: u32, cache_bytes: u64) -> Result<()> {
        let _guard = self.control_lock.lock();
        let tracer = self.tracer_in_use(minor)?;

        tracer.set_cache_size(cache_bytes);
        if tracer.is_active() {
            if let Some(cow) = tracer.cow_lock().as_mut() {
                cow.modify_cache_size(tracer.effective_cache_size());
            }
        }
        Ok(())
    }

    /// Grow the COW backing file by `size_mib`.
    pub fn expand_cow(&self, minor: u32, size_mib: u64) -> Result<()> {
        let _guard = self.control_lock.lock();
        let tracer = self.tracer_in_use(minor)?;

        if tracer.read_fail_state() != 0 {
            return Err(Error::Busy(format!(
                "cannot expand cow file on failed minor {}",
                minor
            )));
        }

        let mut guard = tracer.cow_lock();
        let cow = guard
            .as_mut()
            .ok_or_else(|| Error::Invalid(format!("minor {} has no open cow file", minor)))?;
        cow.expand_datastore(mib_to_bytes(size_mib)).map_err(|err| {
            tracer.set_fail_state(err.errno());
            err
        })
    }

    /// Permit the COW worker to grow the backing file automatically.
    pub fn reconfigure_auto_expand(
        &self,
        minor: u32,
        step_mib: u64,
        reserved_mib: u64,
    ) -> Result<()> {
        let _guard = self.control_lock.lock();
        let tracer = self.tracer_in_use(minor)?;

        if !tracer.is_active() || !tracer.is_snapshot() {
            return Err(Error::Busy(format!(
                "minor {} is not an active snapshot",
                minor
            )));
        }

        tracer.auto_expand().reconfigure(step_mib, reserved_mib);
        Ok(())
    }

    /// Observability snapshot of `minor`.
    pub fn info(&self, minor: u32) -> Result<TracerInfo> {
        let tracer = self.tracer_in_use(minor)?;
        Ok(TracerInfo::collect(&tracer))
    }

    /// Lowest unallocated minor.
    pub fn get_free_minor(&self) -> Result<u32> {
        self.table.free_minor()
    }

    /// Open a handle on the snapshot image of `minor`.
    pub fn open_image(&self, minor: u32) -> Result<SnapshotImage> {
        let tracer = self.tracer_in_use(minor)?;
        Ok(SnapshotImage::open(tracer))
    }

    /// Mount notification: activate matching unverified or dormant tracers.
    pub fn on_mount(&self, bdev_path: &str, mount_dir: impl AsRef<Path>) -> Result<()> {
        let _guard = self.control_lock.lock();
        let base = self.registry.resolve(bdev_path)?;
        base.set_mounted(mount_dir.as_ref());
        debug!(bdev_path, dir = %mount_dir.as_ref().display(), "mount detected");

        for tracer in self.table.tracers() {
            if tracer.bdev_path() != bdev_path {
                continue;
            }
            if tracer.is_unverified() {
                self.unverified_to_active(&tracer, &base, mount_dir.as_ref());
            } else if !tracer.is_active() {
                self.dormant_to_active(&tracer, mount_dir.as_ref());
            }
        }
        Ok(())
    }

    /// Unmount notification: active tracers whose COW file lives on the
    /// device sync and close into dormancy.
    pub fn on_umount(&self, bdev_path: &str) -> Result<()> {
        let _guard = self.control_lock.lock();
        let base = self.registry.resolve(bdev_path)?;
        debug!(bdev_path, "unmount detected");

        for tracer in self.table.tracers() {
            if tracer.bdev_path() != bdev_path
                || !tracer.is_active()
                || tracer.read_fail_state() != 0
            {
                continue;
            }
            self.active_to_dormant(&tracer);
        }

        base.set_unmounted();
        Ok(())
    }

    fn active_to_dormant(&self, tracer: &Arc<Tracer>) {
        debug!(minor = tracer.minor(), "transitioning to dormant");
        tracer.stop_workers();

        let result = match tracer.cow_lock().as_mut() {
            Some(cow) => cow.sync_and_close(),
            None => Ok(()),
        };
        match result {
            Ok(()) => tracer.set_state(0, ACTIVE),
            Err(err) => {
                warn!(minor = tracer.minor(), error = %err, "error entering dormant state");
                tracer.set_fail_state(err.errno());
            }
        }
    }

    fn dormant_to_active(&self, tracer: &Arc<Tracer>, mount_dir: &Path) {
        debug!(minor = tracer.minor(), "transitioning dormant to active");
        let cow_path = mount_dir.join(tracer.cow_rel_path());

        let result = match tracer.cow_lock().as_mut() {
            Some(cow) => cow.reopen(&cow_path),
            None => Err(Error::Invalid("dormant tracer has no cow state".to_string())),
        };

        match result {
            Ok(()) => {
                tracer.set_cow_paths(cow_path, tracer.cow_rel_path());
                if tracer.is_snapshot() {
                    self.start_snap_workers(tracer);
                } else {
                    self.start_inc_workers(tracer);
                }
                tracer.set_state(ACTIVE, UNVERIFIED);
            }
            Err(err) => {
                warn!(minor = tracer.minor(), error = %err, "error reopening cow file");
                tracer.set_fail_state(err.errno());
            }
        }
    }

    fn unverified_to_active(&self, tracer: &Arc<Tracer>, base: &Arc<BaseDevice>, mount_dir: &Path) {
        debug!(minor = tracer.minor(), "activating unverified tracer");

        // the device behind the path must still be the one recorded at
        // reload time
        if let Some(recorded) = tracer.base() {
            if !recorded.same_identity(base) {
                warn!(minor = tracer.minor(), "base device identity changed since reload");
                tracer.set_fail_state(-blocksnap_core::errno::ENODEV);
                return;
            }
        }

        let snapshot = tracer.is_snapshot();
        let cow_path = mount_dir.join(tracer.cow_rel_path());

        let result = (|| -> Result<()> {
            tracer.set_base(Arc::clone(base));
            let mut cow = CowManager::reload(
                &cow_path,
                base.nr_sects(),
                COW_SECTION_SIZE,
                tracer.effective_cache_size(),
                !snapshot,
            )?;
            tracer.set_falloc_bytes(cow.file_size());
            if snapshot {
                self.attach_expansion(tracer, &mut cow);
            }
            *tracer.cow_lock() = Some(cow);
            self.record_cow_file(tracer, base, &cow_path)?;

            tracer.set_state(ACTIVE, UNVERIFIED);
            if snapshot {
                self.start_snap_workers(tracer);
            } else {
                self.start_inc_workers(tracer);
            }
            self.install_tracing(tracer, base)?;
            Ok(())
        })();

        if let Err(err) = result {
            warn!(minor = tracer.minor(), error = %err, "error activating unverified tracer");
            self.teardown_partial(tracer);
            tracer.set_state(UNVERIFIED, ACTIVE);
            tracer.set_fail_state(err.errno());
        }
    }
}
