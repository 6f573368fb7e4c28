//! # Blocksnap
//!
//! A block-level copy-on-write snapshot and incremental change tracking
//! engine. Given a live base volume and a regular backing file, blocksnap
//! exposes a read-only snapshot image that preserves the volume's contents
//! at activation time while the volume keeps taking writes. In incremental
//! mode it records which blocks changed without preserving data.
//!
//! # Quick Start
//!
//! ```no_run
//! use blocksnap::{Controller, DiskRegistry, MemStore};
//! use std::sync::Arc;
//!
//! fn main() -> blocksnap::Result<()> {
//!     // the environment: a disk and its mount state
//!     let registry = Arc::new(DiskRegistry::new());
//!     let base = registry.add_disk("/dev/mem0", Box::new(MemStore::new(1 << 16)));
//!     base.set_mounted("/mnt/data");
//!
//!     // snapshot the device into a COW backing file on its filesystem
//!     let ctl = Controller::new(Arc::clone(&registry));
//!     ctl.setup_snapshot(0, "/dev/mem0", "/mnt/data/backing.cow", 64, 0)?;
//!
//!     // the snapshot image serves the point-in-time view
//!     let image = ctl.open_image(0)?;
//!     let mut buf = vec![0u8; 4096];
//!     image.read_at(0, &mut buf)?;
//!
//!     // later: stop preserving data, keep tracking changed blocks
//!     drop(image);
//!     ctl.transition_to_incremental(0)?;
//!     println!("changed: {}", ctl.info(0)?.nr_changed_blocks);
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! | Crate | Responsibility |
//! |-------|---------------|
//! | `blocksnap-core` | errors, block units, the bio and block-device model |
//! | `blocksnap-cow` | the COW backing file: header, sectioned index, data region |
//! | `blocksnap-tracer` | per-device state machine, interception, workers, control surface |
//!
//! The [`Controller`] is the entry point; it maps directly onto the control
//! channel an external CLI or library wraps. Mount and unmount events are
//! fed in through [`Controller::on_mount`] and [`Controller::on_umount`].

pub use blocksnap_core::{
    errno, Bio, BioCompletion, BioOp, BioVec, BlockStore, Disk, DiskRegistry, Error, MemStore,
    Result, SectorRange, SectorSet, COW_BLOCK_SIZE, COW_HEADER_SIZE, COW_SECTION_SIZE,
    SECTORS_PER_BLOCK, SECTOR_SIZE,
};
pub use blocksnap_cow::{
    AutoExpandConfig, AutoExpandManager, CowHeader, CowManager, SpaceInfo, COW_CLEAN,
    COW_INDEX_ONLY, COW_MAGIC, COW_UUID_SIZE, COW_VERSION_CHANGED_BLOCKS,
};
pub use blocksnap_tracer::{
    to_errno, Controller, MemoryProbe, SnapshotImage, Tracer, TracerInfo, ACTIVE,
    MAX_SNAP_DEVICES, SNAPSHOT, UNVERIFIED,
};

// `BaseDevice` is part of the environment surface (mount events, identity)
pub use blocksnap_core::BaseDevice;
