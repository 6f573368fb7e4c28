//! Refcounted registry of submit-hook installations.
//!
//! Several partitions of one disk may be traced at once, but the disk's
//! submit function is replaced exactly once. The registry counts tracers per
//! disk; the first acquisition installs the hook and only the release of the
//! last reference restores the original submitter.

use blocksnap_core::{Disk, SubmitHook};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Process-wide hook refcounts keyed by disk id.
#[derive(Default)]
pub struct HookRegistry {
    refs: Mutex<HashMap<u64, usize>>,
}

impl HookRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        HookRegistry::default()
    }

    /// Take a reference on the disk's hook, installing `hook` when this is
    /// the first tracer on the disk.
    pub fn acquire(&self, disk: &Arc<Disk>, hook: SubmitHook) {
        let mut refs = self.refs.lock();
        let count = refs.entry(disk.id()).or_insert(0);
        if *count == 0 {
            debug!(disk = %disk.name(), "installing tracing hook");
            disk.install_hook(hook);
        }
        *count += 1;
    }

    /// Drop a reference; the last one restores the original submitter.
    pub fn release(&self, disk: &Arc<Disk>) {
        let mut refs = self.refs.lock();
        if let Some(count) = refs.get_mut(&disk.id()) {
            *count -= 1;
            if *count == 0 {
                debug!(disk = %disk.name(), "restoring original submit function");
                disk.clear_hook();
                refs.remove(&disk.id());
            }
        }
    }

    /// Number of tracers holding the disk's hook.
    pub fn ref_count(&self, disk_id: u64) -> usize {
        self.refs.lock().get(&disk_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blocksnap_core::MemStore;

    #[test]
    fn test_last_release_restores_original() {
        let registry = HookRegistry::new();
        let disk = Disk::new("hooked", Box::new(MemStore::new(8)));

        let hook: SubmitHook = Arc::new(|disk, bio| disk.submit_direct(bio));
        registry.acquire(&disk, Arc::clone(&hook));
        registry.acquire(&disk, hook);
        assert!(disk.has_hook());
        assert_eq!(registry.ref_count(disk.id()), 2);

        registry.release(&disk);
        assert!(disk.has_hook());

        registry.release(&disk);
        assert!(!disk.has_hook());
        assert_eq!(registry.ref_count(disk.id()), 0);
    }
}
