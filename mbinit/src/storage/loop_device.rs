//! Loop node allocation.
//!
//! Loop nodes are created on demand inside the private tree. Minors are handed
//! out downward from 255 so they stay clear of the kernel's own low-numbered
//! loop devices.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use mbinit_shared::constants::block::{LOOP_CAPACITY, LOOP_MAJOR, LOOP_MINOR_MAX};
use mbinit_shared::errors::{MbError, MbResult};

use super::SystemOps;
use crate::block::DevKey;

/// Hands out loop nodes for one run. Never reuses a minor or a path.
#[derive(Debug, Default)]
pub struct LoopAllocator {
    created: u32,
    paths: HashSet<PathBuf>,
}

impl LoopAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of loop nodes created so far.
    pub fn created(&self) -> u32 {
        self.created
    }

    /// Create a loop node at `path` with the next free minor.
    pub fn allocate(&mut self, ops: &dyn SystemOps, path: &Path) -> MbResult<DevKey> {
        if self.created >= LOOP_CAPACITY {
            return Err(MbError::DeviceSetup(format!(
                "No loop minors left for {} ({} allocated)",
                path.display(),
                self.created
            )));
        }
        if self.paths.contains(path) {
            return Err(MbError::DeviceSetup(format!(
                "Loop node {} already allocated",
                path.display()
            )));
        }

        let key = DevKey::new(LOOP_MAJOR, LOOP_MINOR_MAX - self.created);
        ops.make_block_node(path, key).map_err(|e| {
            MbError::DeviceSetup(format!(
                "Can't create loop device at {}: {}",
                path.display(),
                e
            ))
        })?;

        self.created += 1;
        self.paths.insert(path.to_path_buf());
        tracing::debug!(node = %path.display(), key = %key, "Allocated loop node");
        Ok(key)
    }
}
