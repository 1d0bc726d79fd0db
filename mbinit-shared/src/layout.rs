//! Private filesystem layout of the init agent.
//!
//! Everything the agent creates lives below one tmpfs root so the real root
//! filesystem can stay read-only:
//!
//! ```text
//! {root}/                        # tmpfs, default /multiboot
//! ├── dev/block/{devname}        # private block nodes
//! ├── dev/block/loopdev:{name}   # loop nodes for replacements
//! ├── sys/                       # private sysfs
//! ├── proc/                      # private procfs
//! ├── bin/
//! ├── bootdev/                   # mounted boot volume
//! ├── esp/                       # mounted ESP
//! ├── stub/                      # scratch mount for fresh filesystems
//! ├── dynstorage:{name}          # growth-store storage file
//! ├── dynmount:{name}/loop.fs    # growth-store mount and backing file
//! ├── loopfile:{name}            # private copy of a UEFI backup (recovery)
//! └── state.json                 # handoff state for later stages
//! ```

use std::path::{Path, PathBuf};

/// Directory and file names inside the private tree.
pub mod names {
    pub const DEV: &str = "dev";
    pub const BLOCK: &str = "block";
    pub const SYS: &str = "sys";
    pub const PROC: &str = "proc";
    pub const BIN: &str = "bin";
    pub const BOOTDEV: &str = "bootdev";
    pub const ESP: &str = "esp";
    pub const STUB: &str = "stub";
    pub const STUB_IDFILE: &str = ".idfile";
    pub const GROWTH_BACKING_FILE: &str = "loop.fs";
    pub const STATE_FILE: &str = "state.json";
    pub const FSTAB: &str = "fstab.multiboot";
    pub const UEFI_BACKUP_DIR: &str = "UEFIESP";
}

/// Default private root.
pub const DEFAULT_ROOT: &str = "/multiboot";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MultibootLayout {
    root: PathBuf,
}

impl MultibootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Private device tree: {root}/dev
    pub fn dev_dir(&self) -> PathBuf {
        self.root.join(names::DEV)
    }

    /// Block nodes: {root}/dev/block
    pub fn block_dir(&self) -> PathBuf {
        self.dev_dir().join(names::BLOCK)
    }

    /// Node for a catalog device: {root}/dev/block/{devname}
    pub fn block_node(&self, devname: &str) -> PathBuf {
        self.block_dir().join(devname)
    }

    /// Loop node for a replaced partition: {root}/dev/block/loopdev:{name}
    pub fn loop_node(&self, name: &str) -> PathBuf {
        self.block_dir().join(format!("loopdev:{}", name))
    }

    pub fn sys_dir(&self) -> PathBuf {
        self.root.join(names::SYS)
    }

    /// Where the block-device enumeration feed lives: {root}/sys/class/block
    pub fn sys_class_block(&self) -> PathBuf {
        self.sys_dir().join("class").join("block")
    }

    pub fn proc_dir(&self) -> PathBuf {
        self.root.join(names::PROC)
    }

    pub fn bin_dir(&self) -> PathBuf {
        self.root.join(names::BIN)
    }

    /// Mounted boot volume: {root}/bootdev
    pub fn bootdev_dir(&self) -> PathBuf {
        self.root.join(names::BOOTDEV)
    }

    /// Mounted ESP: {root}/esp
    pub fn esp_dir(&self) -> PathBuf {
        self.root.join(names::ESP)
    }

    /// Scratch mountpoint for freshly created filesystems
    pub fn stub_dir(&self) -> PathBuf {
        self.root.join(names::STUB)
    }

    /// Marker written into every fresh stub filesystem
    pub fn stub_idfile(&self) -> PathBuf {
        self.stub_dir().join(names::STUB_IDFILE)
    }

    /// Storage file of a growth store: {root}/dynstorage:{name}
    pub fn growth_storage(&self, name: &str) -> PathBuf {
        self.root.join(format!("dynstorage:{}", name))
    }

    /// Mountpoint of a growth store: {root}/dynmount:{name}
    pub fn growth_mount(&self, name: &str) -> PathBuf {
        self.root.join(format!("dynmount:{}", name))
    }

    /// Lazily backed image inside a growth store: {root}/dynmount:{name}/loop.fs
    pub fn growth_backing_file(&self, name: &str) -> PathBuf {
        self.growth_mount(name).join(names::GROWTH_BACKING_FILE)
    }

    /// Private copy of a UEFI partition backup: {root}/loopfile:{name}
    pub fn private_loopfile(&self, name: &str) -> PathBuf {
        self.root.join(format!("loopfile:{}", name))
    }

    /// Extracted device fstab: {root}/fstab.multiboot
    pub fn fstab_file(&self) -> PathBuf {
        self.root.join(names::FSTAB)
    }

    /// Handoff state: {root}/state.json
    pub fn state_file(&self) -> PathBuf {
        self.root.join(names::STATE_FILE)
    }

    /// Path of a file below the mounted boot volume.
    ///
    /// `path` is absolute relative to the volume root (as found on the command
    /// line), so the leading `/` is stripped before joining.
    pub fn on_bootdev(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.bootdev_dir().join(relative)
    }
}

impl Default for MultibootLayout {
    fn default() -> Self {
        Self::new(DEFAULT_ROOT)
    }
}
