//! Agent configuration.
//!
//! The agent normally runs as the kernel's init with no arguments, so every
//! field has a default matching the on-device layout.

use std::path::PathBuf;
use std::time::Duration;

use mbinit_shared::layout::DEFAULT_ROOT;
use mbinit_shared::MultibootLayout;

use crate::storage::ToolPaths;

/// Default watchdog, whole bootstrap including the boot device wait.
pub const DEFAULT_WATCHDOG: Duration = Duration::from_secs(15);

#[derive(Clone, Debug)]
pub struct InitConfig {
    /// Private tree root
    pub root: PathBuf,
    /// Root of the initramfs holding `init.rc`, `file_contexts` and ROM fstabs
    pub system_root: PathBuf,
    /// Kernel command line; `None` reads it from the private procfs
    pub cmdline: Option<PathBuf>,
    /// Device fstab with multiboot/UEFI tags
    pub multiboot_fstab: PathBuf,
    /// Program to exec after bootstrap
    pub init: PathBuf,
    pub watchdog: Duration,
    /// Present only in recovery ramdisks
    pub recovery_marker: PathBuf,
    /// FUSE control node needed by growth stores
    pub fuse_node: PathBuf,
    pub tools: ToolPaths,
}

impl InitConfig {
    pub fn layout(&self) -> MultibootLayout {
        MultibootLayout::new(&self.root)
    }

    pub fn cmdline_path(&self) -> PathBuf {
        self.cmdline
            .clone()
            .unwrap_or_else(|| self.layout().proc_dir().join("cmdline"))
    }
}

impl Default for InitConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            system_root: PathBuf::from("/"),
            cmdline: None,
            multiboot_fstab: PathBuf::from("/multiboot.fstab"),
            init: PathBuf::from("/init"),
            watchdog: DEFAULT_WATCHDOG,
            recovery_marker: PathBuf::from("/sbin/recovery"),
            fuse_node: PathBuf::from("/dev/fuse"),
            tools: ToolPaths::default(),
        }
    }
}
