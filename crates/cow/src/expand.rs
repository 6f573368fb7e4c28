//! Auto-expansion side-car for the COW data region.
//!
//! The side-car carries the operator-configured growth step and reserved
//! space behind its own mutex: the COW worker reads it when the write head
//! hits the end of the file while reconfigure writes it from the control
//! path.

use blocksnap_core::mib_to_bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Operator-configured expansion parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AutoExpandConfig {
    /// How much to grow the backing file per expansion, in MiB. Zero
    /// disables auto-expansion.
    pub step_mib: u64,
    /// Free space that must remain on the backing filesystem after an
    /// expansion, in MiB.
    pub reserved_mib: u64,
}

/// Shared auto-expansion state for one COW manager.
#[derive(Debug, Default)]
pub struct AutoExpandManager {
    config: Mutex<AutoExpandConfig>,
}

impl AutoExpandManager {
    /// Create a side-car with expansion disabled.
    pub fn new() -> Self {
        AutoExpandManager::default()
    }

    /// Replace the expansion parameters.
    pub fn reconfigure(&self, step_mib: u64, reserved_mib: u64) {
        let mut config = self.config.lock();
        config.step_mib = step_mib;
        config.reserved_mib = reserved_mib;
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> AutoExpandConfig {
        *self.config.lock()
    }

    /// Grant an expansion allowance in bytes, or 0 when expansion is
    /// disabled or would eat into the reserved space.
    ///
    /// `available_blocks` and `block_size_bytes` describe free space on the
    /// filesystem holding the backing file.
    pub fn allowance(&self, available_blocks: u64, block_size_bytes: u64) -> u64 {
        let config = self.config.lock();
        if config.step_mib == 0 {
            return 0;
        }

        let needed = mib_to_bytes(config.step_mib + config.reserved_mib);
        if needed.div_ceil(block_size_bytes.max(1)) <= available_blocks {
            mib_to_bytes(config.step_mib)
        } else {
            warn!(
                step_mib = config.step_mib,
                reserved_mib = config.reserved_mib,
                available_blocks,
                block_size_bytes,
                "rejected auto-expand"
            );
            0
        }
    }

    /// Allowance when free-space data is unavailable: only granted when no
    /// space is reserved.
    pub fn allowance_free_unknown(&self) -> u64 {
        let config = self.config.lock();
        if config.step_mib != 0 && config.reserved_mib == 0 {
            mib_to_bytes(config.step_mib)
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_by_default() {
        let aem = AutoExpandManager::new();
        assert_eq!(aem.allowance(u64::MAX, 4096), 0);
        assert_eq!(aem.allowance_free_unknown(), 0);
    }

    #[test]
    fn test_allowance_granted_when_space_remains() {
        let aem = AutoExpandManager::new();
        aem.reconfigure(4, 8);

        // 12 MiB needed at 4 KiB blocks = 3072 blocks
        assert_eq!(aem.allowance(3072, 4096), mib_to_bytes(4));
        assert_eq!(aem.allowance(3071, 4096), 0);
    }

    #[test]
    fn test_free_unknown_requires_zero_reserve() {
        let aem = AutoExpandManager::new();
        aem.reconfigure(4, 0);
        assert_eq!(aem.allowance_free_unknown(), mib_to_bytes(4));

        aem.reconfigure(4, 1);
        assert_eq!(aem.allowance_free_unknown(), 0);
    }

    #[test]
    fn test_reconfigure_visible() {
        let aem = AutoExpandManager::new();
        aem.reconfigure(16, 2);
        let config = aem.config();
        assert_eq!(config.step_mib, 16);
        assert_eq!(config.reserved_mib, 2);
    }
}
