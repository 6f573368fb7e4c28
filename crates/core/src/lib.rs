//! Core types for the blocksnap engine
//!
//! This crate holds everything the storage and tracing layers share:
//!
//! - Error model: one [`Error`] enum mapped to the errno values the control
//!   surface reports
//! - Block units: sectors, COW blocks, sections and the conversions between
//!   them
//! - The bio model: [`Bio`], [`BioVec`], completions and sector sets
//! - The block-device model: [`Disk`], [`BaseDevice`], the process-wide
//!   [`DiskRegistry`] and mount bookkeeping

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bio;
pub mod device;
pub mod error;
pub mod units;

pub use bio::{Bio, BioCompletion, BioEndIo, BioOp, BioVec, SectorSet};
pub use device::{BaseDevice, BlockStore, Disk, DiskRegistry, MemStore, SubmitHook};
pub use error::{errno, Error, Result};
pub use units::{
    bytes_to_blocks_ceil, mib_to_bytes, sector_to_block, SectorRange, COW_BLOCK_SHIFT,
    COW_BLOCK_SIZE, COW_HEADER_SIZE, COW_SECTION_SIZE, SECTORS_PER_BLOCK, SECTOR_SHIFT,
    SECTOR_SIZE,
};
