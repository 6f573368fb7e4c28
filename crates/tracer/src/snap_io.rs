//! Snapshot and incremental I/O paths.
//!
//! Write interception in snapshot mode clones the target region as a read,
//! submits the clone to the base device, and flips the completed clone into
//! a write of the preserved data against the COW store. The original write
//! is released to the base device only after every clone has been queued.
//!
//! Snapshot-image reads synthesize their result from the base device and
//! the COW store: every byte of the request is classified exactly once by
//! walking COW-block-bounded slices of the bio's byte range.
//!
//! Incremental mode copies nothing; it extracts the modified sector runs
//! and queues them for sentinel stamping.

use crate::tracer::Tracer;
use crate::tracing_params::TracingParams;
use blocksnap_core::units::{round_down_to_block, round_up_to_block};
use blocksnap_core::{
    Bio, BioOp, BioVec, Disk, Error, Result, SectorSet, COW_BLOCK_SIZE, SECTORS_PER_BLOCK,
    SECTOR_SIZE,
};
use blocksnap_cow::CowManager;
use std::sync::Arc;
use tracing::{debug, error};

/// Most COW-block pages a single read clone may carry.
pub const BIO_MAX_PAGES: u64 = 256;

/// Where a snapshot read's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    /// Every touched block has a preserved copy.
    CowOnly,
    /// No touched block has a preserved copy.
    BaseOnly,
    /// Some of each.
    Mixed,
}

/// Intercept a write in snapshot mode.
///
/// Bios that target the COW file itself, arrive in the fail state, or hit
/// memory pressure are forwarded untraced; the base volume always stays
/// consistent.
pub(crate) fn snap_trace_bio(tracer: &Arc<Tracer>, disk: &Arc<Disk>, bio: Bio) {
    if !bio.needs_cow(tracer.cow_inode()) || tracer.read_fail_state() != 0 {
        disk.submit_direct(bio);
        return;
    }

    if tracer.mem_probe().is_low() {
        debug!(minor = tracer.minor(), "memory pressure, forwarding untraced");
        tracer.set_nomem_fail();
        disk.submit_direct(bio);
        return;
    }

    // read clones must cover whole COW blocks
    let sect_off = tracer.sect_off();
    let mut start_sect = round_down_to_block(bio.sector - sect_off) + sect_off;
    let end_sect = round_up_to_block(bio.sector + bio.size_sectors() - sect_off) + sect_off;
    let mut pages = (end_sect - start_sect) / SECTORS_PER_BLOCK;

    let tp = TracingParams::new(Arc::clone(&tracer.orig_bios), bio);

    loop {
        let (clone, bytes) = make_read_clone(tracer, Arc::clone(&tp), start_sect, pages);

        tracer.inc_submitted();
        disk.submit_direct(clone);

        // keep creating clones until the whole region is covered
        if bytes / COW_BLOCK_SIZE < pages {
            start_sect += bytes / SECTOR_SIZE;
            pages -= bytes / COW_BLOCK_SIZE;
            continue;
        }
        break;
    }
}

/// Build a read clone of up to `pages` COW blocks starting at `start_sect`,
/// wired to hand its completion to [`on_read_clone_complete`].
fn make_read_clone(
    tracer: &Arc<Tracer>,
    tp: Arc<TracingParams>,
    start_sect: u64,
    pages: u64,
) -> (Bio, u64) {
    let nr_pages = pages.min(BIO_MAX_PAGES);

    let mut clone = Bio::new(BioOp::Read, start_sect);
    for _ in 0..nr_pages {
        clone.push_vec(BioVec::new(vec![0u8; COW_BLOCK_SIZE as usize]));
    }

    let tracer = Arc::clone(tracer);
    let clone = clone.with_end_io(move |bio, err| {
        on_read_clone_complete(&tracer, tp, bio, err);
    });

    (clone, nr_pages * COW_BLOCK_SIZE)
}

/// End-of-read handler: flip the clone into a write of preserved data and
/// queue it for the COW worker. Dropping `tp` here is what eventually
/// releases the original write.
fn on_read_clone_complete(tracer: &Arc<Tracer>, tp: Arc<TracingParams>, mut bio: Bio, err: i32) {
    if err != 0 {
        error!(minor = tracer.minor(), err, "read clone failed");
        tracer.set_fail_state(err);
        tracer.inc_received();
        drop(tp);
        return;
    }

    bio.op = BioOp::Write;
    bio.sector -= tracer.sect_off();
    tracer.cow_bios.add(bio);
    tracer.inc_received();
    drop(tp);
}

/// COW worker write half: preserve every block carried by a completed read
/// clone. The clone is block-aligned by construction.
pub(crate) fn snap_handle_write_bio(cow: &mut CowManager, bio: &Bio) -> Result<()> {
    let mut block = bio.sector / SECTORS_PER_BLOCK;
    for vec in bio.vecs.iter() {
        let nr_blocks = vec.data.len() as u64 / COW_BLOCK_SIZE;
        for i in 0..nr_blocks {
            let from = (i * COW_BLOCK_SIZE) as usize;
            let to = from + COW_BLOCK_SIZE as usize;
            cow.write_current(block, &vec.data[from..to])?;
            block += 1;
        }
    }
    Ok(())
}

/// Classify a snapshot read by walking its byte range, one block-bounded
/// slice at a time.
fn snap_read_bio_mode(cow: &mut CowManager, bio: &Bio) -> Result<ReadMode> {
    let mut curr_byte = bio.sector * SECTOR_SIZE;
    let mut saw_cow = false;
    let mut saw_base = false;

    for vec in bio.vecs.iter() {
        let len = vec.data.len() as u64;
        let mut off = 0u64;
        while off < len {
            let chunk = (COW_BLOCK_SIZE - curr_byte % COW_BLOCK_SIZE).min(len - off);

            if cow.read_mapping(curr_byte / COW_BLOCK_SIZE)? != 0 {
                saw_cow = true;
            } else {
                saw_base = true;
            }
            if saw_cow && saw_base {
                return Ok(ReadMode::Mixed);
            }

            curr_byte += chunk;
            off += chunk;
        }
    }

    Ok(if saw_cow {
        ReadMode::CowOnly
    } else {
        ReadMode::BaseOnly
    })
}

/// Serve a snapshot-image read: pull current data from the base device
/// where nothing is preserved, then overwrite the preserved slices from the
/// COW store.
pub(crate) fn snap_handle_read_bio(tracer: &Tracer, bio: &mut Bio) -> Result<()> {
    let base = tracer
        .base()
        .ok_or_else(|| Error::NoDevice("snapshot read without base device".to_string()))?;
    let sect_off = base.sect_off();

    let mut guard = tracer.cow_lock();
    let cow = guard
        .as_mut()
        .ok_or_else(|| Error::Invalid("snapshot read without cow manager".to_string()))?;

    let mode = snap_read_bio_mode(cow, bio)?;

    if mode != ReadMode::CowOnly {
        let mut sector = sect_off + bio.sector;
        for vec in bio.vecs.iter_mut() {
            base.disk().read_sectors(sector, &mut vec.data)?;
            sector += vec.data.len() as u64 / SECTOR_SIZE;
        }
    }

    if mode != ReadMode::BaseOnly {
        let mut curr_byte = bio.sector * SECTOR_SIZE;
        for vec in bio.vecs.iter_mut() {
            let len = vec.data.len() as u64;
            let mut off = 0u64;
            while off < len {
                let block_off = curr_byte % COW_BLOCK_SIZE;
                let chunk = (COW_BLOCK_SIZE - block_off).min(len - off);

                let mapping = cow.read_mapping(curr_byte / COW_BLOCK_SIZE)?;
                if mapping != 0 {
                    let slice = &mut vec.data[off as usize..(off + chunk) as usize];
                    cow.read_data(slice, mapping, block_off)?;
                }

                curr_byte += chunk;
                off += chunk;
            }
        }
    }

    Ok(())
}

/// Intercept a write in incremental mode: record the changed sector runs,
/// then forward the bio unchanged.
pub(crate) fn inc_trace_bio(tracer: &Arc<Tracer>, disk: &Arc<Disk>, bio: Bio) {
    let sect_off = tracer.sect_off();

    if bio.op == BioOp::WriteZeroes {
        tracer.pending_ssets.add(SectorSet {
            sect: bio.sector - sect_off,
            len: bio.size_sectors(),
        });
        disk.submit_direct(bio);
        return;
    }

    let cow_inode = tracer.cow_inode();
    let mut run_start: Option<u64> = None;
    let mut end_sect = bio.sector;

    for vec in bio.vecs.iter() {
        let on_cow_file = cow_inode.is_some() && vec.inode == cow_inode;
        if !on_cow_file {
            if run_start.is_none() {
                run_start = Some(end_sect);
            }
        } else if let Some(start) = run_start.take() {
            if end_sect > start {
                tracer.pending_ssets.add(SectorSet {
                    sect: start - sect_off,
                    len: end_sect - start,
                });
            }
        }
        end_sect += vec.data.len() as u64 / SECTOR_SIZE;
    }

    if let Some(start) = run_start {
        if end_sect > start {
            tracer.pending_ssets.add(SectorSet {
                sect: start - sect_off,
                len: end_sect - start,
            });
        }
    }

    disk.submit_direct(bio);
}

/// Sector-set worker half: stamp the sentinel for every COW block the run
/// covers.
pub(crate) fn inc_handle_sset(cow: &mut CowManager, sset: &SectorSet) -> Result<()> {
    let start_block = sset.sect / SECTORS_PER_BLOCK;
    let end_block = (sset.sect + sset.len).div_ceil(SECTORS_PER_BLOCK);
    for block in start_block..end_block {
        cow.write_filler_mapping(block)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_cow(dir: &std::path::Path) -> CowManager {
        // 512 sectors = 64 blocks
        CowManager::init(dir.join("cow.dat"), 512, 8, 64 * 1024, 1024 * 1024, None, 1).unwrap()
    }

    #[test]
    fn test_sset_covers_partial_blocks() {
        let dir = tempdir().unwrap();
        let mut cow = test_cow(dir.path());

        // sectors 6..=18 touch blocks 0, 1 and 2
        inc_handle_sset(&mut cow, &SectorSet { sect: 6, len: 13 }).unwrap();

        assert_eq!(cow.read_mapping(0).unwrap(), 1);
        assert_eq!(cow.read_mapping(1).unwrap(), 1);
        assert_eq!(cow.read_mapping(2).unwrap(), 1);
        assert_eq!(cow.read_mapping(3).unwrap(), 0);
        assert_eq!(cow.nr_changed_blocks(), 3);
    }

    #[test]
    fn test_read_mode_classification() {
        let dir = tempdir().unwrap();
        let mut cow = test_cow(dir.path());
        cow.write_current(1, &vec![0xAA; COW_BLOCK_SIZE as usize])
            .unwrap();

        let mut base_only = Bio::new(BioOp::Read, 16);
        base_only.push_vec(BioVec::new(vec![0u8; 4096]));
        assert_eq!(
            snap_read_bio_mode(&mut cow, &base_only).unwrap(),
            ReadMode::BaseOnly
        );

        let mut cow_only = Bio::new(BioOp::Read, 8);
        cow_only.push_vec(BioVec::new(vec![0u8; 4096]));
        assert_eq!(
            snap_read_bio_mode(&mut cow, &cow_only).unwrap(),
            ReadMode::CowOnly
        );

        let mut mixed = Bio::new(BioOp::Read, 0);
        mixed.push_vec(BioVec::new(vec![0u8; 8192]));
        assert_eq!(
            snap_read_bio_mode(&mut cow, &mixed).unwrap(),
            ReadMode::Mixed
        );
    }

    #[test]
    fn test_write_bio_preserves_blocks() {
        let dir = tempdir().unwrap();
        let mut cow = test_cow(dir.path());

        let mut bio = Bio::new(BioOp::Write, 8);
        bio.push_vec(BioVec::new(vec![0x11; 4096]));
        bio.push_vec(BioVec::new(vec![0x22; 4096]));
        snap_handle_write_bio(&mut cow, &bio).unwrap();

        let mut buf = vec![0u8; 4096];
        let mapping = cow.read_mapping(1).unwrap();
        cow.read_data(&mut buf, mapping, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0x11));

        let mapping = cow.read_mapping(2).unwrap();
        cow.read_data(&mut buf, mapping, 0).unwrap();
        assert!(buf.iter().all(|&b| b == 0x22));
    }
}
