//! Background workers.
//!
//! Each traced device runs at most two long-lived threads: the COW worker
//! (snapshot mode) or the sector-set worker (incremental mode), plus the
//! forwarding worker that releases original writes to the base device.
//! Workers park on their queue, observe the stop flag between iterations
//! and drain their queue on stop. The first observation of the fail state
//! tears down the COW manager's in-memory side; queued reads then answer
//! EIO and queued writes are freed unprocessed.

use crate::snap_io::{inc_handle_sset, snap_handle_read_bio, snap_handle_write_bio};
use crate::tracer::{Tracer, WorkerHandle};
use blocksnap_core::{errno, BioOp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

const WORKER_POLL: Duration = Duration::from_millis(50);

/// Start the snapshot-mode COW worker.
pub(crate) fn spawn_cow_worker(tracer: Arc<Tracer>) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name(format!("blocksnap-cow{}", tracer.minor()))
        .spawn(move || cow_worker_loop(&tracer, &worker_stop))
        .expect("failed to spawn cow worker thread");
    WorkerHandle::new(stop, handle)
}

fn cow_worker_loop(tracer: &Arc<Tracer>, stop: &AtomicBool) {
    let mut is_failed = false;

    loop {
        if !is_failed && tracer.read_fail_state() != 0 {
            debug!(
                minor = tracer.minor(),
                "error detected in cow worker, cleaning up cow"
            );
            is_failed = true;
            if let Some(cow) = tracer.cow_lock().as_mut() {
                cow.free_members();
            }
        }

        let Some(bio) = tracer.cow_bios.dequeue_delay_read() else {
            if stop.load(Ordering::SeqCst)
                && tracer.cow_bios.is_empty()
                && tracer.clones_drained()
            {
                break;
            }
            tracer.cow_bios.wait_nonempty(WORKER_POLL);
            continue;
        };

        match bio.op {
            BioOp::Read => {
                if is_failed {
                    bio.complete(-errno::EIO);
                    continue;
                }

                let mut bio = bio;
                match snap_handle_read_bio(tracer, &mut bio) {
                    Ok(()) => bio.complete(0),
                    Err(err) => {
                        error!(minor = tracer.minor(), error = %err, "error handling read bio");
                        tracer.set_fail_state(err.errno());
                        bio.complete(-errno::EIO);
                    }
                }
            }
            _ => {
                if is_failed {
                    continue;
                }

                let result = {
                    let mut guard = tracer.cow_lock();
                    match guard.as_mut() {
                        Some(cow) => snap_handle_write_bio(cow, &bio),
                        None => Ok(()),
                    }
                };
                if let Err(err) = result {
                    error!(minor = tracer.minor(), error = %err, "error handling write bio");
                    tracer.set_fail_state(err.errno());
                }
            }
        }
    }
}

/// Start the incremental-mode sector-set worker.
pub(crate) fn spawn_sset_worker(tracer: Arc<Tracer>) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name(format!("blocksnap-sset{}", tracer.minor()))
        .spawn(move || sset_worker_loop(&tracer, &worker_stop))
        .expect("failed to spawn sset worker thread");
    WorkerHandle::new(stop, handle)
}

fn sset_worker_loop(tracer: &Arc<Tracer>, stop: &AtomicBool) {
    let mut is_failed = false;

    loop {
        if !is_failed && tracer.read_fail_state() != 0 {
            debug!(
                minor = tracer.minor(),
                "error detected in sset worker, cleaning up cow"
            );
            is_failed = true;
            if let Some(cow) = tracer.cow_lock().as_mut() {
                cow.free_members();
            }
        }

        let Some(sset) = tracer.pending_ssets.dequeue() else {
            if stop.load(Ordering::SeqCst) && tracer.pending_ssets.is_empty() {
                break;
            }
            tracer.pending_ssets.wait_nonempty(WORKER_POLL);
            continue;
        };

        if is_failed {
            continue;
        }

        let result = {
            let mut guard = tracer.cow_lock();
            match guard.as_mut() {
                Some(cow) => inc_handle_sset(cow, &sset),
                None => Ok(()),
            }
        };
        if let Err(err) = result {
            error!(minor = tracer.minor(), error = %err, "error handling sector set");
            tracer.set_fail_state(err.errno());
        }
    }
}

/// Start the worker that releases original writes to the base device.
pub(crate) fn spawn_forward_worker(tracer: Arc<Tracer>) -> WorkerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let worker_stop = Arc::clone(&stop);
    let handle = std::thread::Builder::new()
        .name(format!("blocksnap-fwd{}", tracer.minor()))
        .spawn(move || forward_worker_loop(&tracer, &worker_stop))
        .expect("failed to spawn forwarding worker thread");
    WorkerHandle::new(stop, handle)
}

fn forward_worker_loop(tracer: &Arc<Tracer>, stop: &AtomicBool) {
    loop {
        let Some(mut bio) = tracer.orig_bios.dequeue() else {
            if stop.load(Ordering::SeqCst) && tracer.orig_bios.is_empty() {
                break;
            }
            tracer.orig_bios.wait_nonempty(WORKER_POLL);
            continue;
        };

        // resubmit with the passthrough marker so the interceptor hands it
        // straight to the original submitter
        bio.passthrough = true;
        match tracer.base() {
            Some(base) => base.submit(bio),
            None => bio.complete(-errno::ENODEV),
        }
    }
}
