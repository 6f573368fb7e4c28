//! On-disk COW file header.
//!
//! The header occupies the first 4096 bytes of the backing file.
//!
//! # Layout (little-endian)
//!
//! ```text
//! ┌────────┬──────┬─────────────────────────────────────────────┐
//! │ Offset │ Size │ Meaning                                     │
//! ├────────┼──────┼─────────────────────────────────────────────┤
//! │ 0      │ 4    │ magic = 4776                                │
//! │ 4      │ 4    │ flags: CLEAN, INDEX_ONLY, VMALLOC_UPPER     │
//! │ 8      │ 8    │ curr_pos (write head, in blocks)            │
//! │ 16     │ 8    │ file_size (bytes)                           │
//! │ 24     │ 8    │ seqid                                       │
//! │ 32     │ 16   │ uuid                                        │
//! │ 48     │ 8    │ version (0 original, 1 CHANGED_BLOCKS)      │
//! │ 56     │ 8    │ nr_changed_blocks (version >= 1)            │
//! │ 64     │ 4032 │ reserved                                    │
//! └────────┴──────┴─────────────────────────────────────────────┘
//! ```
//!
//! The `CLEAN` bit is cleared when the file is opened and set on orderly
//! close; a reload that finds it cleared rejects the file.

use blocksnap_core::COW_HEADER_SIZE;
use byteorder::{ByteOrder, LittleEndian};

/// Magic constant identifying a COW backing file.
pub const COW_MAGIC: u32 = 4776;

/// Set while the file is closed and its on-disk state is consistent.
pub const COW_CLEAN: u32 = 1 << 0;

/// Set when the data region has been truncated away (incremental tracking).
pub const COW_INDEX_ONLY: u32 = 1 << 1;

/// Records that the section array came from the fallback upper-memory
/// allocator. Advisory; reset to the reloading process's preference.
pub const COW_VMALLOC_UPPER: u32 = 1 << 2;

/// Format version that introduced the changed-blocks counter.
pub const COW_VERSION_CHANGED_BLOCKS: u64 = 1;

/// Size of the UUID field in bytes.
pub const COW_UUID_SIZE: usize = 16;

/// In-memory image of the on-disk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CowHeader {
    /// Magic constant, [`COW_MAGIC`] for a valid file.
    pub magic: u32,
    /// State flag word.
    pub flags: u32,
    /// Current write head position in blocks from the file start.
    pub curr_pos: u64,
    /// Logical file size in bytes.
    pub file_size: u64,
    /// Sequence id, bumped on every transition into snapshot mode.
    pub seqid: u64,
    /// UUID shared across the lifetime of a snapshot chain.
    pub uuid: [u8; COW_UUID_SIZE],
    /// On-disk format version.
    pub version: u64,
    /// Index entries that went from 0 to nonzero since the snapshot began.
    pub nr_changed_blocks: u64,
}

/// Header parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Fewer than [`COW_HEADER_SIZE`] bytes available.
    #[error("truncated cow header")]
    Truncated,

    /// Magic constant mismatch.
    #[error("bad magic number found in cow file: {0}")]
    BadMagic(u32),
}

impl CowHeader {
    /// Serialize the header into its 4096-byte on-disk form.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; COW_HEADER_SIZE as usize];
        LittleEndian::write_u32(&mut bytes[0..4], self.magic);
        LittleEndian::write_u32(&mut bytes[4..8], self.flags);
        LittleEndian::write_u64(&mut bytes[8..16], self.curr_pos);
        LittleEndian::write_u64(&mut bytes[16..24], self.file_size);
        LittleEndian::write_u64(&mut bytes[24..32], self.seqid);
        bytes[32..48].copy_from_slice(&self.uuid);
        LittleEndian::write_u64(&mut bytes[48..56], self.version);
        LittleEndian::write_u64(&mut bytes[56..64], self.nr_changed_blocks);
        bytes
    }

    /// Parse a header from the first 4096 bytes of a backing file.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < COW_HEADER_SIZE as usize {
            return Err(HeaderError::Truncated);
        }

        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != COW_MAGIC {
            return Err(HeaderError::BadMagic(magic));
        }

        let mut uuid = [0u8; COW_UUID_SIZE];
        uuid.copy_from_slice(&bytes[32..48]);

        Ok(CowHeader {
            magic,
            flags: LittleEndian::read_u32(&bytes[4..8]),
            curr_pos: LittleEndian::read_u64(&bytes[8..16]),
            file_size: LittleEndian::read_u64(&bytes[16..24]),
            seqid: LittleEndian::read_u64(&bytes[24..32]),
            uuid,
            version: LittleEndian::read_u64(&bytes[48..56]),
            nr_changed_blocks: LittleEndian::read_u64(&bytes[56..64]),
        })
    }

    /// Whether the clean-close bit is set.
    pub fn is_clean(&self) -> bool {
        self.flags & COW_CLEAN != 0
    }

    /// Whether the file holds only header and index.
    pub fn is_index_only(&self) -> bool {
        self.flags & COW_INDEX_ONLY != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> CowHeader {
        CowHeader {
            magic: COW_MAGIC,
            flags: COW_CLEAN,
            curr_pos: 42,
            file_size: 1024 * 1024,
            seqid: 3,
            uuid: [0xAB; COW_UUID_SIZE],
            version: COW_VERSION_CHANGED_BLOCKS,
            nr_changed_blocks: 17,
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let header = sample_header();
        let bytes = header.encode();
        assert_eq!(bytes.len(), COW_HEADER_SIZE as usize);

        let parsed = CowHeader::decode(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_field_offsets() {
        let bytes = sample_header().encode();
        assert_eq!(LittleEndian::read_u32(&bytes[0..4]), 4776);
        assert_eq!(LittleEndian::read_u64(&bytes[8..16]), 42);
        assert_eq!(LittleEndian::read_u64(&bytes[24..32]), 3);
        assert_eq!(&bytes[32..48], &[0xAB; 16]);
        assert_eq!(LittleEndian::read_u64(&bytes[56..64]), 17);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = sample_header().encode();
        bytes[0] = 0xFF;
        assert!(matches!(
            CowHeader::decode(&bytes),
            Err(HeaderError::BadMagic(_))
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let bytes = sample_header().encode();
        assert!(matches!(
            CowHeader::decode(&bytes[..100]),
            Err(HeaderError::Truncated)
        ));
    }

    #[test]
    fn test_flag_queries() {
        let mut header = sample_header();
        assert!(header.is_clean());
        assert!(!header.is_index_only());

        header.flags = COW_INDEX_ONLY;
        assert!(!header.is_clean());
        assert!(header.is_index_only());
    }
}
