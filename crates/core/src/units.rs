//! Block units and conversions.
//!
//! The engine works in three granularities: 512-byte base-device sectors,
//! 4096-byte COW blocks (the unit of preservation), and index sections of
//! 4096 mappings (the unit of caching and eviction). All on-disk offsets
//! into the COW store are block-indexed.

/// Base-device sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// log2 of the sector size.
pub const SECTOR_SHIFT: u32 = 9;

/// Size of one COW block in bytes, the granularity of the index and data
/// store.
pub const COW_BLOCK_SIZE: u64 = 4096;

/// log2 of the COW block size.
pub const COW_BLOCK_SHIFT: u32 = 12;

/// Sectors per COW block.
pub const SECTORS_PER_BLOCK: u64 = COW_BLOCK_SIZE / SECTOR_SIZE;

/// Mappings per index section (32 KiB of index per section).
pub const COW_SECTION_SIZE: u64 = 4096;

/// Size of the on-disk COW header in bytes.
pub const COW_HEADER_SIZE: u64 = 4096;

/// Convert a sector number to the COW block that contains it.
#[inline]
pub fn sector_to_block(sect: u64) -> u64 {
    sect / SECTORS_PER_BLOCK
}

/// Number of COW blocks needed to cover `bytes`.
#[inline]
pub fn bytes_to_blocks_ceil(bytes: u64) -> u64 {
    bytes.div_ceil(COW_BLOCK_SIZE)
}

/// Convert mebibytes to bytes.
#[inline]
pub fn mib_to_bytes(mib: u64) -> u64 {
    mib * 1024 * 1024
}

/// Round `sect` down to a COW-block boundary.
#[inline]
pub fn round_down_to_block(sect: u64) -> u64 {
    sect - (sect % SECTORS_PER_BLOCK)
}

/// Round `sect` up to a COW-block boundary.
#[inline]
pub fn round_up_to_block(sect: u64) -> u64 {
    sect.div_ceil(SECTORS_PER_BLOCK) * SECTORS_PER_BLOCK
}

/// A contiguous run of sectors on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    /// First sector of the range.
    pub start: u64,
    /// Number of sectors.
    pub len: u64,
}

impl SectorRange {
    /// Create a new range.
    pub fn new(start: u64, len: u64) -> Self {
        SectorRange { start, len }
    }

    /// One past the last sector.
    pub fn end(&self) -> u64 {
        self.start + self.len
    }

    /// Inclusive overlap test: `max(start1, start2) <= min(end1, end2)`.
    pub fn overlaps(&self, other: &SectorRange) -> bool {
        self.start.max(other.start) <= self.end().min(other.end())
    }

    /// True when the range covers no sectors.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_block_conversions() {
        assert_eq!(sector_to_block(0), 0);
        assert_eq!(sector_to_block(7), 0);
        assert_eq!(sector_to_block(8), 1);
        assert_eq!(sector_to_block(17), 2);
    }

    #[test]
    fn test_block_rounding() {
        assert_eq!(round_down_to_block(0), 0);
        assert_eq!(round_down_to_block(7), 0);
        assert_eq!(round_down_to_block(9), 8);
        assert_eq!(round_up_to_block(1), 8);
        assert_eq!(round_up_to_block(8), 8);
        assert_eq!(round_up_to_block(9), 16);
    }

    #[test]
    fn test_bytes_to_blocks() {
        assert_eq!(bytes_to_blocks_ceil(0), 0);
        assert_eq!(bytes_to_blocks_ceil(1), 1);
        assert_eq!(bytes_to_blocks_ceil(4096), 1);
        assert_eq!(bytes_to_blocks_ceil(4097), 2);
    }

    #[test]
    fn test_range_overlap() {
        let a = SectorRange::new(0, 8);
        let b = SectorRange::new(8, 8);
        let c = SectorRange::new(17, 8);

        // adjacent ranges touch under the inclusive test
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
        assert!(!a.overlaps(&c));
        assert!(b.overlaps(&SectorRange::new(10, 2)));
    }

    #[test]
    fn test_mib_to_bytes() {
        assert_eq!(mib_to_bytes(1), 1024 * 1024);
        assert_eq!(mib_to_bytes(0), 0);
    }
}
