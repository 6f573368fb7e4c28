//! COW manager: header integrity, sectioned index cache, data-region append.
//!
//! The manager owns the backing file. The index maps each COW block of the
//! base device to either 0 (unchanged), 1 (changed but not preserved, the
//! incremental sentinel) or the block position in the data region that holds
//! the preserved copy. The index is split into sections of `sect_size`
//! mappings; sections are loaded and evicted as a unit, driven by per-section
//! usage counters.
//!
//! # File layout
//!
//! ```text
//! ┌──────────────────────────────┐ 0
//! │ Header (4 KiB)               │
//! ├──────────────────────────────┤ COW_HEADER_SIZE
//! │ Index: total_sects sections  │
//! │ of sect_size u64 mappings    │
//! ├──────────────────────────────┤ data_offset
//! │ Data region: 4 KiB blocks,   │
//! │ appended at curr_pos         │
//! └──────────────────────────────┘
//! ```

use crate::expand::AutoExpandManager;
use crate::header::{
    CowHeader, COW_CLEAN, COW_INDEX_ONLY, COW_MAGIC, COW_UUID_SIZE, COW_VERSION_CHANGED_BLOCKS,
    COW_VMALLOC_UPPER,
};
use blocksnap_core::{Error, Result, COW_BLOCK_SIZE, COW_HEADER_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Free-space snapshot of the filesystem holding the backing file.
#[derive(Debug, Clone, Copy)]
pub struct SpaceInfo {
    /// Free blocks available to unprivileged writers.
    pub available_blocks: u64,
    /// Filesystem block size in bytes.
    pub block_size: u64,
}

/// Probe installed by the tracer so the manager can ask about free space
/// without owning the device. Returns `None` when the data is unavailable.
pub type SpaceProbe = Box<dyn Fn() -> Option<SpaceInfo> + Send + Sync>;

/// One cached slice of the mapping index.
#[derive(Debug, Default)]
struct CowSection {
    /// Set once the section has ever held mappings, in memory or on disk.
    has_data: bool,
    /// Access counter driving eviction.
    usage: u64,
    /// Resident mappings, or `None` while paged out.
    mappings: Option<Box<[u64]>>,
}

/// The COW manager for one traced device.
impl std::fmt::Debug for CowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CowManager")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("curr_pos", &self.curr_pos)
            .field("data_offset", &self.data_offset)
            .field("file_size", &self.file_size)
            .field("seqid", &self.seqid)
            .field("version", &self.version)
            .field("nr_changed_blocks", &self.nr_changed_blocks)
            .field("uuid", &self.uuid)
            .field("sect_size", &self.sect_size)
            .field("total_sects", &self.total_sects)
            .field("allowed_sects", &self.allowed_sects)
            .field("allocated_sects", &self.allocated_sects)
            .finish_non_exhaustive()
    }
}

pub struct CowManager {
    file: Option<File>,
    path: PathBuf,
    flags: u32,
    curr_pos: u64,
    data_offset: u64,
    file_size: u64,
    seqid: u64,
    version: u64,
    nr_changed_blocks: u64,
    uuid: [u8; COW_UUID_SIZE],
    sect_size: u64,
    total_sects: u64,
    allowed_sects: u64,
    allocated_sects: u64,
    sects: Vec<CowSection>,
    auto_expand: Option<Arc<AutoExpandManager>>,
    space_probe: Option<SpaceProbe>,
}

fn allowed_sects_for(cache_bytes: u64, total_sects: u64, sect_size: u64) -> u64 {
    let bookkeeping = total_sects * std::mem::size_of::<CowSection>() as u64;
    if cache_bytes <= bookkeeping {
        0
    } else {
        (cache_bytes - bookkeeping) / (sect_size * 8)
    }
}

impl CowManager {
    /// Create a new COW file at `path` and initialize the manager over it.
    ///
    /// `elements` is the base device's sector count; `sect_size` the number
    /// of mappings per section; `file_max` the pre-allocated file size in
    /// bytes. A fresh UUID is generated when none is supplied.
    pub fn init(
        path: impl AsRef<Path>,
        elements: u64,
        sect_size: u64,
        cache_bytes: u64,
        file_max: u64,
        uuid: Option<[u8; COW_UUID_SIZE]>,
        seqid: u64,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), seqid, "creating cow file");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let total_sects = elements.div_ceil(sect_size * 8);
        let data_offset = COW_HEADER_SIZE + total_sects * sect_size * 8;

        let mut cm = CowManager {
            file: Some(file),
            path,
            flags: 0,
            curr_pos: data_offset.div_ceil(COW_BLOCK_SIZE),
            data_offset,
            file_size: file_max,
            seqid,
            version: COW_VERSION_CHANGED_BLOCKS,
            nr_changed_blocks: 0,
            uuid: uuid.unwrap_or_else(|| *uuid::Uuid::new_v4().as_bytes()),
            sect_size,
            total_sects,
            allowed_sects: allowed_sects_for(cache_bytes, total_sects, sect_size),
            allocated_sects: 0,
            sects: Vec::new(),
            auto_expand: None,
            space_probe: None,
        };
        cm.sects.resize_with(total_sects as usize, CowSection::default);

        debug!(
            total_sects = cm.total_sects,
            allowed_sects = cm.allowed_sects,
            file_max,
            "allocating cow file"
        );
        cm.file_ref()?.set_len(file_max)?;
        cm.write_header(false)?;

        Ok(cm)
    }

    /// Reload the manager from an existing, cleanly closed COW file.
    ///
    /// Every section is marked as having data so that first access loads it
    /// from disk. `index_only` states the mode the caller expects the file
    /// to be in (incremental reload vs snapshot reload).
    pub fn reload(
        path: impl AsRef<Path>,
        elements: u64,
        sect_size: u64,
        cache_bytes: u64,
        index_only: bool,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!(path = %path.display(), index_only, "reloading cow file");

        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let total_sects = elements.div_ceil(sect_size * 8);
        let data_offset = COW_HEADER_SIZE + total_sects * sect_size * 8;

        let mut cm = CowManager {
            file: Some(file),
            path,
            flags: 0,
            curr_pos: 0,
            data_offset,
            file_size: 0,
            seqid: 0,
            version: 0,
            nr_changed_blocks: 0,
            uuid: [0u8; COW_UUID_SIZE],
            sect_size,
            total_sects,
            allowed_sects: allowed_sects_for(cache_bytes, total_sects, sect_size),
            allocated_sects: 0,
            sects: Vec::new(),
            auto_expand: None,
            space_probe: None,
        };
        cm.sects.resize_with(total_sects as usize, CowSection::default);

        cm.open_header(index_only, true)?;

        for sect in cm.sects.iter_mut() {
            sect.has_data = true;
        }

        Ok(cm)
    }

    /// Reopen the backing file after a dormant period.
    ///
    /// The in-memory state (geometry, mode, section residency bookkeeping)
    /// survives dormancy; only the file handle was dropped. `path` is the
    /// file's current location, which moves when the filesystem is
    /// remounted elsewhere.
    pub fn reopen(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        debug!(path = %path.display(), "reopening cow file");
        if self.file.is_some() {
            return Err(Error::Invalid("cow file is already open".to_string()));
        }

        let file = OpenOptions::new().read(true).write(true).open(path)?;
        self.path = path.to_path_buf();
        self.file = Some(file);

        let index_only = self.flags & COW_INDEX_ONLY != 0;
        self.open_header(index_only, false)
    }

    fn file_ref(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| Error::Invalid("cow file is not open".to_string()))
    }

    /// Read and validate the on-disk header, adopt its fields, then write
    /// it back dirty.
    fn open_header(&mut self, index_only: bool, reset_vmalloc: bool) -> Result<()> {
        let mut bytes = vec![0u8; COW_HEADER_SIZE as usize];
        self.file_ref()?.read_exact_at(&mut bytes, 0)?;

        let header = CowHeader::decode(&bytes)
            .map_err(|err| Error::Invalid(format!("error opening cow header: {}", err)))?;

        if !header.is_clean() {
            return Err(Error::Invalid(format!(
                "cow file not left in clean state: {}",
                header.flags
            )));
        }

        if header.is_index_only() != index_only {
            return Err(Error::Invalid(format!(
                "cow file not left in {} state: {}",
                if index_only {
                    "index only"
                } else {
                    "data tracking"
                },
                header.flags
            )));
        }

        debug!(
            curr_pos = header.curr_pos,
            seqid = header.seqid,
            "cow header opened"
        );

        self.flags = if reset_vmalloc {
            header.flags & !COW_VMALLOC_UPPER
        } else {
            header.flags
        };
        self.curr_pos = header.curr_pos;
        self.file_size = header.file_size;
        self.seqid = header.seqid;
        self.uuid = header.uuid;
        self.version = header.version;
        self.nr_changed_blocks = header.nr_changed_blocks;

        self.write_header(false)
    }

    /// Transfer in-memory header state to disk, setting or clearing the
    /// clean bit.
    fn write_header(&mut self, is_clean: bool) -> Result<()> {
        if is_clean {
            self.flags |= COW_CLEAN;
            debug!("writing COW header CLEAN");
        } else {
            self.flags &= !COW_CLEAN;
            debug!("writing COW header DIRTY");
        }

        let header = CowHeader {
            magic: COW_MAGIC,
            flags: self.flags,
            curr_pos: self.curr_pos,
            file_size: self.file_size,
            seqid: self.seqid,
            uuid: self.uuid,
            version: self.version,
            nr_changed_blocks: self.nr_changed_blocks,
        };
        self.file_ref()?.write_all_at(&header.encode(), 0)?;
        Ok(())
    }

    fn section_offset(&self, sect_idx: u64) -> u64 {
        COW_HEADER_SIZE + sect_idx * self.sect_size * 8
    }

    fn alloc_section(&mut self, sect_idx: u64) {
        let sect = &mut self.sects[sect_idx as usize];
        sect.mappings = Some(vec![0u64; self.sect_size as usize].into_boxed_slice());
        sect.has_data = true;
        self.allocated_sects += 1;
    }

    fn load_section(&mut self, sect_idx: u64) -> Result<()> {
        let mut bytes = vec![0u8; (self.sect_size * 8) as usize];
        self.file_ref()?
            .read_exact_at(&mut bytes, self.section_offset(sect_idx))?;

        let mut mappings = vec![0u64; self.sect_size as usize].into_boxed_slice();
        LittleEndian::read_u64_into(&bytes, &mut mappings);

        let sect = &mut self.sects[sect_idx as usize];
        sect.mappings = Some(mappings);
        self.allocated_sects += 1;
        Ok(())
    }

    fn write_section(&self, sect_idx: u64) -> Result<()> {
        let mappings = self.sects[sect_idx as usize]
            .mappings
            .as_ref()
            .expect("writing a non-resident section");

        let mut bytes = vec![0u8; (self.sect_size * 8) as usize];
        LittleEndian::write_u64_into(mappings, &mut bytes);
        self.file_ref()?
            .write_all_at(&bytes, self.section_offset(sect_idx))?;
        Ok(())
    }

    fn free_section(&mut self, sect_idx: u64) {
        self.sects[sect_idx as usize].mappings = None;
        self.allocated_sects -= 1;
    }

    /// Flush and free resident sections. A zero threshold frees everything;
    /// otherwise sections with usage at or below the threshold are released
    /// until the cache is half its allowance.
    fn sync_and_free_sections(&mut self, thresh: u64) -> Result<()> {
        for i in 0..self.total_sects {
            if thresh != 0 && self.allocated_sects <= self.allowed_sects / 2 {
                break;
            }
            if self.sects[i as usize].mappings.is_some()
                && (thresh == 0 || self.sects[i as usize].usage <= thresh)
            {
                self.write_section(i)?;
                self.free_section(i);
            }
        }

        for sect in self.sects.iter_mut() {
            sect.usage = 0;
        }
        Ok(())
    }

    /// Evict roughly the less-used half of the cache.
    ///
    /// The threshold starts at half the maximum usage and is refined by
    /// halving a granularity each step, shifting toward whichever side of
    /// the split holds fewer sections, until the counts balance.
    fn cleanup_mappings(&mut self) -> Result<()> {
        let mut thresh = self
            .sects
            .iter()
            .map(|s| s.usage)
            .max()
            .unwrap_or(0);

        thresh /= 2;
        let mut granularity = thresh;
        while granularity > 0 {
            granularity >>= 1;
            let mut less = 0u64;
            let mut greater = 0u64;
            for sect in self.sects.iter() {
                if sect.usage <= thresh {
                    less += 1;
                } else {
                    greater += 1;
                }
            }

            if greater > less {
                thresh += granularity;
            } else if greater < less {
                thresh -= granularity;
            } else {
                break;
            }
        }

        self.sync_and_free_sections(thresh)
    }

    fn maybe_evict(&mut self) -> Result<()> {
        if self.allocated_sects > self.allowed_sects {
            self.cleanup_mappings()?;
        }
        Ok(())
    }

    /// Read the mapping for a COW block. An untouched section answers 0
    /// without allocating.
    pub fn read_mapping(&mut self, pos: u64) -> Result<u64> {
        let sect_idx = pos / self.sect_size;
        let sect_pos = (pos % self.sect_size) as usize;
        if sect_idx >= self.total_sects {
            return Err(Error::Invalid(format!(
                "mapping position {} beyond index of {} sections",
                pos, self.total_sects
            )));
        }

        self.sects[sect_idx as usize].usage += 1;

        if self.sects[sect_idx as usize].mappings.is_none() {
            if !self.sects[sect_idx as usize].has_data {
                return Ok(0);
            }
            self.load_section(sect_idx)?;
        }

        let value = self.sects[sect_idx as usize]
            .mappings
            .as_ref()
            .expect("section resident after load")[sect_pos];

        self.maybe_evict()?;
        Ok(value)
    }

    /// Store a mapping value, counting 0-to-nonzero transitions when the
    /// format version carries the changed-blocks counter.
    pub fn write_mapping(&mut self, pos: u64, val: u64) -> Result<()> {
        let sect_idx = pos / self.sect_size;
        let sect_pos = (pos % self.sect_size) as usize;
        if sect_idx >= self.total_sects {
            return Err(Error::Invalid(format!(
                "mapping position {} beyond index of {} sections",
                pos, self.total_sects
            )));
        }

        self.sects[sect_idx as usize].usage += 1;

        if self.sects[sect_idx as usize].mappings.is_none() {
            if !self.sects[sect_idx as usize].has_data {
                self.alloc_section(sect_idx);
            } else {
                self.load_section(sect_idx)?;
            }
        }

        let mappings = self.sects[sect_idx as usize]
            .mappings
            .as_mut()
            .expect("section resident after alloc or load");

        if self.version >= COW_VERSION_CHANGED_BLOCKS && mappings[sect_pos] == 0 {
            self.nr_changed_blocks += 1;
        }
        mappings[sect_pos] = val;

        self.maybe_evict()
    }

    /// Stamp the incremental sentinel for a changed block.
    pub fn write_filler_mapping(&mut self, pos: u64) -> Result<()> {
        self.write_mapping(pos, 1)
    }

    /// Append one COW block to the data region, expanding the file when the
    /// side-car permits.
    fn write_data(&mut self, buf: &[u8]) -> Result<()> {
        loop {
            let curr_size = self.curr_pos * COW_BLOCK_SIZE;
            if curr_size < self.file_size {
                self.file_ref()?.write_all_at(buf, curr_size)?;
                self.curr_pos += 1;
                return Ok(());
            }

            let allowance = match self.auto_expand.as_ref() {
                Some(aem) => match self.space_probe.as_ref().and_then(|probe| probe()) {
                    Some(space) => aem.allowance(space.available_blocks, space.block_size),
                    None => {
                        warn!(
                            "free space unknown, expansion allowance is given \
                             only if reserved space is 0"
                        );
                        aem.allowance_free_unknown()
                    }
                },
                None => 0,
            };

            if allowance == 0 {
                return Err(Error::FileTooBig {
                    used: curr_size,
                    limit: self.file_size,
                });
            }
            self.expand_datastore(allowance)?;
        }
    }

    /// Preserve `buf` as the copy of `block`, unless the block already has
    /// a mapping. The mapping is written before the data; the write head
    /// advances only on a successful data write.
    pub fn write_current(&mut self, block: u64, buf: &[u8]) -> Result<()> {
        if buf.len() as u64 != COW_BLOCK_SIZE {
            return Err(Error::Invalid(format!(
                "cow block write of {} bytes",
                buf.len()
            )));
        }

        let mapping = self.read_mapping(block)?;
        if mapping != 0 {
            return Ok(());
        }

        let target = self.curr_pos;
        self.write_mapping(block, target)?;
        self.write_data(buf)
    }

    /// Read preserved data: `buf.len()` bytes at `block_pos * 4096 +
    /// block_off`.
    pub fn read_data(&self, buf: &mut [u8], block_pos: u64, block_off: u64) -> Result<()> {
        if block_off >= COW_BLOCK_SIZE {
            return Err(Error::Invalid(format!(
                "cow data read at block offset {}",
                block_off
            )));
        }

        self.file_ref()?
            .read_exact_at(buf, block_pos * COW_BLOCK_SIZE + block_off)?;
        Ok(())
    }

    /// Drop the data region: set the index-only flag and truncate the file
    /// to header + index. Used on the snapshot-to-incremental transition.
    pub fn truncate_to_index(&mut self) -> Result<()> {
        self.flags |= COW_INDEX_ONLY;
        self.file_ref()?.set_len(self.data_offset)?;
        self.file_size = self.data_offset;
        Ok(())
    }

    /// Recompute the section-cache allowance for a new cache size.
    pub fn modify_cache_size(&mut self, cache_bytes: u64) {
        self.allowed_sects = allowed_sects_for(cache_bytes, self.total_sects, self.sect_size);
    }

    /// Grow the backing file by `append_bytes`.
    pub fn expand_datastore(&mut self, append_bytes: u64) -> Result<()> {
        debug!(append_bytes, "trying to expand cow file");
        let new_size = self.file_size + append_bytes;
        self.file_ref()?.set_len(new_size)?;
        self.file_size = new_size;
        Ok(())
    }

    /// Flush all sections and the header (clean), then drop the file handle
    /// but keep the in-memory state for dormancy.
    pub fn sync_and_close(&mut self) -> Result<()> {
        debug!(path = %self.path.display(), "syncing and closing cow file");
        let result = (|| -> Result<()> {
            self.sync_and_free_sections(0)?;
            self.write_header(true)?;
            self.file_ref()?.sync_all()?;
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.file = None;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "error while syncing and closing cow manager");
                self.free_members();
                Err(err)
            }
        }
    }

    /// [`CowManager::sync_and_close`] plus consumption of the manager.
    pub fn sync_and_free(mut self) -> Result<()> {
        self.sync_and_close()
    }

    /// Error-path teardown: drop every cached section and unlink the
    /// backing file. On-disk state is not flushed.
    pub fn free_members(&mut self) {
        for sect in self.sects.iter_mut() {
            sect.mappings = None;
        }
        self.allocated_sects = 0;

        if self.file.take().is_some() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %err, "failed to unlink cow file");
            }
        }
    }

    /// Install the auto-expansion side-car and the free-space probe.
    pub fn set_auto_expand(&mut self, aem: Arc<AutoExpandManager>, probe: SpaceProbe) {
        self.auto_expand = Some(aem);
        self.space_probe = Some(probe);
    }

    /// Detach the auto-expansion side-car.
    pub fn clear_auto_expand(&mut self) {
        self.auto_expand = None;
        self.space_probe = None;
    }

    /// Sequence id of this file in its snapshot chain.
    pub fn seqid(&self) -> u64 {
        self.seqid
    }

    /// UUID of the snapshot chain.
    pub fn uuid(&self) -> [u8; COW_UUID_SIZE] {
        self.uuid
    }

    /// On-disk format version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Index entries that transitioned from 0 to nonzero since the snapshot
    /// began.
    pub fn nr_changed_blocks(&self) -> u64 {
        self.nr_changed_blocks
    }

    /// Current write head position in blocks.
    pub fn curr_pos(&self) -> u64 {
        self.curr_pos
    }

    /// Logical maximum file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// First byte of the data region.
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Whether the file holds only header and index.
    pub fn is_index_only(&self) -> bool {
        self.flags & COW_INDEX_ONLY != 0
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    fn allocated_sects(&self) -> u64 {
        self.allocated_sects
    }
}
