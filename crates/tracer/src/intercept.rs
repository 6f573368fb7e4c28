//! The submit-path interceptor.
//!
//! Installed in front of a traced disk's request path. Runs in the
//! submitter's context and never blocks on disk I/O: every decision is a
//! state check and, at most, a lock-protected queue insert.

use crate::control::DeviceTable;
use crate::snap_io::{inc_trace_bio, snap_trace_bio};
use blocksnap_core::{Bio, BioOp, Disk};
use std::sync::Arc;

/// Classify and route one bio submitted against a traced disk.
///
/// In order: passthrough marker, no matching active tracer, fail state,
/// then reads, discards and empty requests, all of which forward to the
/// original submitter. Plain writes and write-zeroes route to the snapshot
/// or incremental trace path.
pub(crate) fn tracing_fn(table: &DeviceTable, disk: &Arc<Disk>, mut bio: Bio) {
    if bio.passthrough {
        bio.passthrough = false;
        disk.submit_direct(bio);
        return;
    }

    let Some(tracer) = table.find_tracer_for(disk.id(), &bio) else {
        disk.submit_direct(bio);
        return;
    };

    if tracer.read_fail_state() != 0 {
        disk.submit_direct(bio);
        return;
    }

    if bio.size_bytes() == 0 {
        disk.submit_direct(bio);
        return;
    }

    if tracer.is_snapshot() {
        match bio.op {
            BioOp::Write | BioOp::WriteZeroes => snap_trace_bio(&tracer, disk, bio),
            _ => disk.submit_direct(bio),
        }
    } else {
        match bio.op {
            BioOp::Write | BioOp::WriteZeroes => inc_trace_bio(&tracer, disk, bio),
            _ => disk.submit_direct(bio),
        }
    }
}
