//! End-to-end snapshot and incremental scenarios against the facade.
//!
//! Each test stands up a memory-backed disk, points a COW backing file at a
//! temporary directory standing in for the device's mounted filesystem, and
//! drives writes through the intercepted submit path exactly as a
//! filesystem above the device would.

use blocksnap::{
    BaseDevice, Bio, BioCompletion, BioOp, BioVec, Controller, CowHeader, CowManager,
    DiskRegistry, MemStore, MemoryProbe, COW_HEADER_SIZE, COW_INDEX_ONLY,
};
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};

const CACHE: u64 = 64 * 1024;
const BLOCK: usize = 4096;

struct Env {
    _registry: Arc<DiskRegistry>,
    base: Arc<BaseDevice>,
    ctl: Controller,
    mount: TempDir,
}

fn setup_env(sectors: u64) -> Env {
    let registry = Arc::new(DiskRegistry::new());
    let base = registry.add_disk("/dev/mem0", Box::new(MemStore::new(sectors)));
    let mount = tempdir().unwrap();
    base.set_mounted(mount.path());
    let ctl = Controller::with_probes(Arc::clone(&registry), 8, MemoryProbe::disabled());
    Env {
        _registry: registry,
        base,
        ctl,
        mount,
    }
}

fn cow_path(env: &Env, name: &str) -> String {
    env.mount.path().join(name).display().to_string()
}

/// Submit a write through the traced path and wait for it to land.
fn write_to_base(base: &Arc<BaseDevice>, sector: u64, data: Vec<u8>) {
    let completion = BioCompletion::new();
    let mut bio = Bio::new(BioOp::Write, sector).with_completion(Arc::clone(&completion));
    bio.push_vec(BioVec::new(data));
    base.submit(bio);
    let (_, err) = completion.wait();
    assert_eq!(err, 0, "base write failed");
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timed out waiting for {}",
            what
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

// Two-block device, one write. The snapshot answers the
// pre-write contents while the base device shows the new data.
#[test]
fn test_one_write_preserves_old_contents() {
    let env = setup_env(16);
    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();

    write_to_base(&env.base, 8, vec![0xAA; BLOCK]);

    let image = env.ctl.open_image(0).unwrap();
    let mut snap = vec![0u8; BLOCK];
    image.read_at(8, &mut snap).unwrap();
    assert!(snap.iter().all(|&b| b == 0), "snapshot must see pre-write zeroes");

    let mut live = vec![0u8; BLOCK];
    env.base.disk().read_sectors(8, &mut live).unwrap();
    assert!(live.iter().all(|&b| b == 0xAA), "base must see the new data");

    wait_until("changed-block accounting", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 1
    });
}

// Two writes to the same block preserve only the first
// pre-image and count one changed block.
#[test]
fn test_double_write_is_idempotent() {
    let env = setup_env(16);
    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();

    write_to_base(&env.base, 8, vec![0xAA; BLOCK]);
    write_to_base(&env.base, 8, vec![0xBB; BLOCK]);

    let image = env.ctl.open_image(0).unwrap();
    let mut snap = vec![0u8; BLOCK];
    image.read_at(8, &mut snap).unwrap();
    assert!(snap.iter().all(|&b| b == 0));

    wait_until("changed-block accounting", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 1
    });

    let mut live = vec![0u8; BLOCK];
    env.base.disk().read_sectors(8, &mut live).unwrap();
    assert!(live.iter().all(|&b| b == 0xBB));
}

// Write-zeroes is preserved like any other write: the snapshot keeps the
// pre-zeroing contents while the base device reads back zeroes.
#[test]
fn test_write_zeroes_preserves_old_contents() {
    let env = setup_env(16);
    env.base.disk().write_sectors(8, &vec![0xAB; BLOCK]).unwrap();

    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();

    let completion = BioCompletion::new();
    let mut bio = Bio::new(BioOp::WriteZeroes, 8).with_completion(Arc::clone(&completion));
    bio.push_vec(BioVec::new(vec![0u8; BLOCK]));
    env.base.submit(bio);
    let (_, err) = completion.wait();
    assert_eq!(err, 0, "write-zeroes failed");

    let image = env.ctl.open_image(0).unwrap();
    let mut snap = vec![0u8; BLOCK];
    image.read_at(8, &mut snap).unwrap();
    assert!(
        snap.iter().all(|&b| b == 0xAB),
        "snapshot must see the pre-zeroing contents"
    );

    let mut live = vec![0u8; BLOCK];
    env.base.disk().read_sectors(8, &mut live).unwrap();
    assert!(live.iter().all(|&b| b == 0), "base must read back zeroes");

    wait_until("changed-block accounting", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 1
    });
}

// A read spanning touched and untouched blocks merges live and
// preserved data.
#[test]
fn test_mixed_read_merges_base_and_cow() {
    let env = setup_env(64);

    // distinct pattern per block before the snapshot begins
    for block in 0..8u8 {
        env.base
            .disk()
            .write_sectors(block as u64 * 8, &vec![block; BLOCK])
            .unwrap();
    }

    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();

    write_to_base(&env.base, 24, vec![0xFF; BLOCK]); // block 3

    let image = env.ctl.open_image(0).unwrap();
    let mut snap = vec![0u8; 8 * BLOCK];
    image.read_at(0, &mut snap).unwrap();

    for block in 0..8usize {
        let slice = &snap[block * BLOCK..(block + 1) * BLOCK];
        assert!(
            slice.iter().all(|&b| b == block as u8),
            "block {} must match its pre-snapshot contents",
            block
        );
    }

    // the live device carries the overwrite
    let mut live = vec![0u8; BLOCK];
    env.base.disk().read_sectors(24, &mut live).unwrap();
    assert!(live.iter().all(|&b| b == 0xFF));
}

// Randomized mixed-read coverage over more blocks.
#[test]
fn test_random_writes_preserve_point_in_time() {
    let env = setup_env(512); // 64 blocks
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);

    let mut before = vec![0u8; 64 * BLOCK];
    rng.fill(&mut before[..]);
    for block in 0..64u64 {
        env.base
            .disk()
            .write_sectors(block * 8, &before[(block as usize) * BLOCK..][..BLOCK])
            .unwrap();
    }

    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();

    // overwrite a third of the blocks, some twice
    for _ in 0..32 {
        let block = rng.gen_range(0..64u64);
        let mut data = vec![0u8; BLOCK];
        rng.fill(&mut data[..]);
        write_to_base(&env.base, block * 8, data);
    }

    let image = env.ctl.open_image(0).unwrap();
    let mut snap = vec![0u8; 64 * BLOCK];
    image.read_at(0, &mut snap).unwrap();
    assert_eq!(snap, before, "snapshot must be byte-for-byte the old volume");
}

// Snapshot to incremental. The file shrinks to header+index,
// the image detaches, and further writes only stamp sentinels.
#[test]
fn test_transition_to_incremental() {
    let env = setup_env(16);
    let path = cow_path(&env, "backing.cow");
    env.ctl.setup_snapshot(0, "/dev/mem0", &path, 1, CACHE).unwrap();

    write_to_base(&env.base, 8, vec![0xAA; BLOCK]);
    wait_until("preservation", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 1
    });
    let seqid_before = env.ctl.info(0).unwrap().seqid;

    env.ctl.transition_to_incremental(0).unwrap();

    let info = env.ctl.info(0).unwrap();
    assert_eq!(info.seqid, seqid_before, "seqid is untouched by snap->inc");

    // file shrank to header + index
    let index_len = std::fs::metadata(&path).unwrap().len();
    assert_eq!(index_len, info.falloc_size);
    assert!(index_len < 1024 * 1024);
    assert_eq!(index_len, COW_HEADER_SIZE + 4096 * 8);

    // the image no longer serves reads
    let image = env.ctl.open_image(0).unwrap();
    let mut buf = vec![0u8; BLOCK];
    let err = image.read_at(8, &mut buf).unwrap_err();
    assert_eq!(err.errno(), -blocksnap::errno::EIO);

    // an incremental write marks its block without copying data
    write_to_base(&env.base, 0, vec![0xBB; BLOCK]);
    wait_until("sentinel stamped", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 2
    });
    assert_eq!(
        std::fs::metadata(&path).unwrap().len(),
        index_len,
        "incremental mode must not append data"
    );
}

// Incremental back to snapshot. Same UUID, seqid + 1, fresh
// changed-block counter; the old file closes clean in index-only state.
#[test]
fn test_transition_back_to_snapshot() {
    let env = setup_env(16);
    let old_path = cow_path(&env, "backing.cow");
    env.ctl
        .setup_snapshot(0, "/dev/mem0", &old_path, 1, CACHE)
        .unwrap();
    write_to_base(&env.base, 8, vec![0xAA; BLOCK]);
    wait_until("preservation", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 1
    });
    env.ctl.transition_to_incremental(0).unwrap();

    write_to_base(&env.base, 0, vec![0xBB; BLOCK]);
    wait_until("sentinel stamped", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 2
    });
    let old_info = env.ctl.info(0).unwrap();

    let new_path = cow_path(&env, "backing2.cow");
    env.ctl.transition_to_snapshot(0, &new_path, 1).unwrap();

    let info = env.ctl.info(0).unwrap();
    assert_eq!(info.uuid, old_info.uuid, "chain uuid is inherited");
    assert_eq!(info.seqid, old_info.seqid + 1);
    assert_eq!(info.nr_changed_blocks, 0);

    // the old file is closed clean, still index-only
    let bytes = std::fs::read(&old_path).unwrap();
    let header = CowHeader::decode(&bytes).unwrap();
    assert!(header.is_clean());
    assert!(header.flags & COW_INDEX_ONLY != 0);

    // the fresh snapshot preserves against the new file
    write_to_base(&env.base, 8, vec![0xCC; BLOCK]);
    let image = env.ctl.open_image(0).unwrap();
    let mut snap = vec![0u8; BLOCK];
    image.read_at(8, &mut snap).unwrap();
    assert!(snap.iter().all(|&b| b == 0xAA), "new snapshot sees the current base as its baseline");
}

// A file that never saw a clean close is refused on reload.
#[test]
fn test_crashed_cow_file_is_refused() {
    let registry = Arc::new(DiskRegistry::new());
    let _base = registry.add_disk("/dev/mem0", Box::new(MemStore::new(128)));
    let mount = tempdir().unwrap();
    let ctl = Controller::with_probes(Arc::clone(&registry), 8, MemoryProbe::disabled());

    {
        // dropped without a clean close, as a crash would leave it
        let _cow = CowManager::init(
            mount.path().join("crash.cow"),
            128,
            4096,
            CACHE,
            1024 * 1024,
            None,
            1,
        )
        .unwrap();
    }

    ctl.reload_snapshot(0, "/dev/mem0", "crash.cow", CACHE).unwrap();
    ctl.on_mount("/dev/mem0", mount.path()).unwrap();

    let info = ctl.info(0).unwrap();
    assert_eq!(info.error, -blocksnap::errno::EINVAL);
}

// By the time the base device carries the new data, the pre-image has
// already been captured: the snapshot never exposes the new bytes.
#[test]
fn test_preservation_ordered_before_release() {
    let env = setup_env(16);
    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();
    let image = env.ctl.open_image(0).unwrap();

    for round in 0..50u8 {
        write_to_base(&env.base, 8, vec![round.wrapping_add(1); BLOCK]);

        let mut snap = vec![0u8; BLOCK];
        image.read_at(8, &mut snap).unwrap();
        assert!(
            snap.iter().all(|&b| b == 0),
            "round {}: snapshot leaked post-write data",
            round
        );
    }

    let tracer = env.ctl.table().get(0).unwrap();
    assert!(tracer.clones_drained(), "every submitted clone was received");
}

// Writes that only touch the COW backing file's own pages are never traced.
#[test]
fn test_cow_file_writeback_is_not_traced() {
    let env = setup_env(16);
    env.ctl
        .setup_snapshot(0, "/dev/mem0", &cow_path(&env, "backing.cow"), 1, CACHE)
        .unwrap();

    let tracer = env.ctl.table().get(0).unwrap();
    let ino = {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata(cow_path(&env, "backing.cow")).unwrap().ino()
    };

    // a write whose pages belong to the cow file's page cache
    let completion = BioCompletion::new();
    let mut bio = Bio::new(BioOp::Write, 0).with_completion(Arc::clone(&completion));
    bio.push_vec(BioVec::from_inode(vec![0x77; BLOCK], ino));
    env.base.submit(bio);
    completion.wait();

    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(env.ctl.info(0).unwrap().nr_changed_blocks, 0);
    assert!(tracer.clones_drained());
}

// A destroyed tracer leaves a cleanly closed, reloadable file behind.
#[test]
fn test_destroy_leaves_clean_reloadable_file() {
    let env = setup_env(16);
    let path = cow_path(&env, "backing.cow");
    env.ctl.setup_snapshot(0, "/dev/mem0", &path, 1, CACHE).unwrap();

    write_to_base(&env.base, 8, vec![0xAA; BLOCK]);
    wait_until("preservation", || {
        env.ctl.info(0).unwrap().nr_changed_blocks == 1
    });
    env.ctl.destroy(0).unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert!(CowHeader::decode(&bytes).unwrap().is_clean());

    // the file reloads as a valid snapshot store
    let mut cow = CowManager::reload(&path, 16, 4096, CACHE, false).unwrap();
    assert_eq!(cow.nr_changed_blocks(), 1);
    assert!(cow.read_mapping(1).unwrap() > 1);
}
