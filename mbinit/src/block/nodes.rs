//! Private device node tree.

use std::path::PathBuf;

use mbinit_shared::errors::MbResult;

use super::catalog::UeventBlockDevice;
use crate::storage::SystemOps;

/// Regenerates device nodes after a catalog change.
pub trait NodeBuilder {
    fn create_nodes(&self, devices: &[UeventBlockDevice]) -> MbResult<()>;
}

/// Creates `{block_dir}/{devname}` block nodes for catalog entries.
///
/// Existing nodes are left alone, so calling this after every rescan only
/// touches devices that appeared since the last call.
pub struct DeviceNodes<'a> {
    block_dir: PathBuf,
    ops: &'a dyn SystemOps,
}

impl<'a> DeviceNodes<'a> {
    pub fn new(block_dir: impl Into<PathBuf>, ops: &'a dyn SystemOps) -> Self {
        Self {
            block_dir: block_dir.into(),
            ops,
        }
    }
}

impl NodeBuilder for DeviceNodes<'_> {
    fn create_nodes(&self, devices: &[UeventBlockDevice]) -> MbResult<()> {
        std::fs::create_dir_all(&self.block_dir)?;

        for device in devices {
            let node = self.block_dir.join(&device.devname);
            if node.symlink_metadata().is_ok() {
                continue;
            }
            // Nested names (e.g. "mapper/foo") need their parent.
            if let Some(parent) = node.parent() {
                std::fs::create_dir_all(parent)?;
            }
            self.ops.make_block_node(&node, device.key)?;
            tracing::trace!(node = %node.display(), key = %device.key, "Created block node");
        }

        Ok(())
    }
}
