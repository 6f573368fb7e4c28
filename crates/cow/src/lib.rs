//! COW store for the blocksnap engine
//!
//! This crate handles everything that touches the COW backing file:
//!
//! - On-disk header: magic, state flags, write head, sequence id, UUID chain
//! - Sectioned mapping index with a usage-driven cache and adaptive-median
//!   eviction
//! - Append-only data region holding preserved COW blocks
//! - Truncate-to-index for incremental tracking
//! - Auto-expansion side-car with free-space-aware allowances

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod expand;
pub mod header;
pub mod manager;

pub use expand::{AutoExpandConfig, AutoExpandManager};
pub use header::{
    CowHeader, HeaderError, COW_CLEAN, COW_INDEX_ONLY, COW_MAGIC, COW_UUID_SIZE,
    COW_VERSION_CHANGED_BLOCKS, COW_VMALLOC_UPPER,
};
pub use manager::{CowManager, SpaceInfo, SpaceProbe};
