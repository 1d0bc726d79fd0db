use std::path::Path;

use mbinit_shared::errors::MbResult;
use nix::mount::MsFlags;

use crate::block::DevKey;

/// Device, mount and helper-tool operations used during bootstrap.
///
/// `HostOps` talks to the kernel and spawns the external helpers; tests
/// substitute an implementation that records calls.
pub trait SystemOps {
    /// Mount `source` at `target`, creating `target` if needed.
    ///
    /// With `fstype == None` and no `MS_BIND`, the type is detected from the
    /// source's superblock.
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> MbResult<()>;

    fn unmount(&self, target: &Path) -> MbResult<()>;

    /// Filesystem type a device is currently mounted with, from the mount table.
    fn mounted_fstype(&self, key: DevKey) -> MbResult<Option<String>>;

    fn make_block_node(&self, path: &Path, key: DevKey) -> MbResult<()>;

    fn make_char_node(&self, path: &Path, key: DevKey) -> MbResult<()>;

    /// Size of a block device in 512-byte sectors.
    fn block_count(&self, device: &Path) -> MbResult<u64>;

    /// Attach `file` to an existing loop node.
    fn attach_loop(&self, loop_device: &Path, file: &Path) -> MbResult<()>;

    fn make_filesystem(&self, device: &Path, fstype: &str) -> MbResult<()>;

    /// Mount a lazily backed growth store exposing a `blocks`-sector image.
    fn mount_growth_store(&self, storage: &Path, mountpoint: &Path, blocks: u64) -> MbResult<()>;

    /// Copy the first `blocks` sectors of `device` into `image`.
    ///
    /// `image` only appears once the copy is complete and synced.
    fn copy_blocks(&self, device: &Path, image: &Path, blocks: u64) -> MbResult<()>;

    fn copy_file(&self, src: &Path, dst: &Path) -> MbResult<()>;

    /// Create an empty file (or leave an existing one untouched).
    fn create_file(&self, path: &Path) -> MbResult<()>;
}
