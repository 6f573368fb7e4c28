//! Tracing layer for the blocksnap engine
//!
//! This crate owns the per-device lifecycle and everything on the I/O hot
//! path:
//!
//! - [`Tracer`]: per-minor state machine (unverified, dormant, active;
//!   snapshot or incremental) with a sticky fail code
//! - The submit-path interceptor and the refcounted hook registry
//! - Background workers: COW, sector-set and original-write forwarding
//! - Bounded bio and sector-set queues with the delay-read discipline
//! - [`SnapshotImage`]: the read-only point-in-time device view
//! - [`Controller`]: the control surface the external CLI/library glue
//!   drives, plus mount/unmount automation

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod control;
pub mod hooks;
pub mod image;
mod intercept;
pub mod memory;
pub mod queue;
mod snap_io;
pub mod tracer;
pub mod tracing_params;
mod worker;

pub use control::{Controller, DeviceTable, PathSpaceProbe, MAX_SNAP_DEVICES};
pub use hooks::HookRegistry;
pub use image::SnapshotImage;
pub use memory::{MemoryProbe, LOW_MEMORY_THRESHOLD_PERCENT};
pub use queue::{BioQueue, SsetQueue};
pub use tracer::{
    to_errno, Tracer, TracerInfo, WorkerHandle, ACTIVE, COW_FALLOCATE_PERCENTAGE_DEFAULT,
    COW_MAX_MEMORY_DEFAULT, DRAIN_WAIT_MAX, SNAPSHOT, UNVERIFIED,
};
pub use tracing_params::TracingParams;
