//! Test fixtures for mbinit integration tests.
//!
//! - [`RecordingOps`]: `SystemOps` that records calls and fakes their effects
//!   on a temp directory
//! - [`SysfsFixture`]: builds `sys/class/block/*/uevent` trees
//! - [`FakeProbe`]: partition UUID probe driven by a GUID → devname table
//! - [`ChannelUevents`]: uevent source fed from a channel
//! - [`TestTree`]: temp root with an `InitConfig` pointing into it

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use mbinit::block::{DevKey, PartUuidProbe, UeventBlockDevice};
use mbinit::bootdev::UeventSource;
use mbinit::storage::{MsFlags, SystemOps};
use mbinit::InitConfig;
use mbinit_shared::errors::{MbError, MbResult};
use mbinit_shared::MultibootLayout;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::sync::mpsc;

// ============================================================================
// RECORDING OPS
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OpCall {
    Mount {
        source: PathBuf,
        target: PathBuf,
        fstype: Option<String>,
        flags: MsFlags,
        data: Option<String>,
    },
    Unmount {
        target: PathBuf,
    },
    MakeBlockNode {
        path: PathBuf,
        key: DevKey,
    },
    MakeCharNode {
        path: PathBuf,
        key: DevKey,
    },
    AttachLoop {
        loop_device: PathBuf,
        file: PathBuf,
    },
    MakeFilesystem {
        device: PathBuf,
        fstype: String,
    },
    MountGrowthStore {
        storage: PathBuf,
        mountpoint: PathBuf,
        blocks: u64,
    },
    CopyBlocks {
        device: PathBuf,
        image: PathBuf,
        blocks: u64,
    },
    CopyFile {
        src: PathBuf,
        dst: PathBuf,
    },
    CreateFile {
        path: PathBuf,
    },
}

/// Records every call. Effects visible to the code under test (directories,
/// node placeholders, copied files) are reproduced on the real filesystem.
#[derive(Default)]
pub struct RecordingOps {
    calls: Mutex<Vec<OpCall>>,
    block_counts: Mutex<HashMap<PathBuf, u64>>,
    default_block_count: Mutex<u64>,
    mounted: Mutex<HashMap<DevKey, String>>,
    failing_mounts: Mutex<Vec<(PathBuf, MsFlags)>>,
}

impl RecordingOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sector count reported for `device`.
    pub fn set_block_count(&self, device: impl Into<PathBuf>, blocks: u64) {
        self.block_counts.lock().insert(device.into(), blocks);
    }

    /// Sector count reported for devices without an explicit count.
    pub fn set_default_block_count(&self, blocks: u64) {
        *self.default_block_count.lock() = blocks;
    }

    /// Report `key` as mounted with `fstype`.
    pub fn set_mounted(&self, key: DevKey, fstype: &str) {
        self.mounted.lock().insert(key, fstype.to_string());
    }

    /// Make mounts of `target` with exactly `flags` fail.
    pub fn fail_mount(&self, target: impl Into<PathBuf>, flags: MsFlags) {
        self.failing_mounts.lock().push((target.into(), flags));
    }

    pub fn calls(&self) -> Vec<OpCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// `(loop_device, file)` pairs in attach order.
    pub fn attachments(&self) -> Vec<(PathBuf, PathBuf)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OpCall::AttachLoop { loop_device, file } => Some((loop_device, file)),
                _ => None,
            })
            .collect()
    }

    /// Block counts requested for growth stores, in call order.
    pub fn growth_requests(&self) -> Vec<u64> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OpCall::MountGrowthStore { blocks, .. } => Some(blocks),
                _ => None,
            })
            .collect()
    }

    /// Keys of created block nodes with the given major.
    pub fn block_nodes(&self, major: u32) -> Vec<(PathBuf, DevKey)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OpCall::MakeBlockNode { path, key } if key.major == major => Some((path, key)),
                _ => None,
            })
            .collect()
    }

    pub fn mount_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OpCall::Mount { target, .. } => Some(target),
                _ => None,
            })
            .collect()
    }

    pub fn unmount_targets(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                OpCall::Unmount { target } => Some(target),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: OpCall) {
        self.calls.lock().push(call);
    }
}

fn placeholder(path: &Path) -> MbResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, b"")?;
    Ok(())
}

impl SystemOps for RecordingOps {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> MbResult<()> {
        self.record(OpCall::Mount {
            source: source.to_path_buf(),
            target: target.to_path_buf(),
            fstype: fstype.map(str::to_string),
            flags,
            data: data.map(str::to_string),
        });
        let fails = self
            .failing_mounts
            .lock()
            .iter()
            .any(|(t, f)| t == target && *f == flags);
        if fails {
            return Err(MbError::DeviceSetup(format!(
                "mount {} refused",
                target.display()
            )));
        }
        fs::create_dir_all(target)?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> MbResult<()> {
        self.record(OpCall::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn mounted_fstype(&self, key: DevKey) -> MbResult<Option<String>> {
        Ok(self.mounted.lock().get(&key).cloned())
    }

    fn make_block_node(&self, path: &Path, key: DevKey) -> MbResult<()> {
        self.record(OpCall::MakeBlockNode {
            path: path.to_path_buf(),
            key,
        });
        placeholder(path)
    }

    fn make_char_node(&self, path: &Path, key: DevKey) -> MbResult<()> {
        self.record(OpCall::MakeCharNode {
            path: path.to_path_buf(),
            key,
        });
        placeholder(path)
    }

    fn block_count(&self, device: &Path) -> MbResult<u64> {
        let explicit = self.block_counts.lock().get(device).copied();
        Ok(explicit.unwrap_or(*self.default_block_count.lock()))
    }

    fn attach_loop(&self, loop_device: &Path, file: &Path) -> MbResult<()> {
        self.record(OpCall::AttachLoop {
            loop_device: loop_device.to_path_buf(),
            file: file.to_path_buf(),
        });
        Ok(())
    }

    fn make_filesystem(&self, device: &Path, fstype: &str) -> MbResult<()> {
        self.record(OpCall::MakeFilesystem {
            device: device.to_path_buf(),
            fstype: fstype.to_string(),
        });
        Ok(())
    }

    fn mount_growth_store(&self, storage: &Path, mountpoint: &Path, blocks: u64) -> MbResult<()> {
        self.record(OpCall::MountGrowthStore {
            storage: storage.to_path_buf(),
            mountpoint: mountpoint.to_path_buf(),
            blocks,
        });
        fs::create_dir_all(mountpoint)?;
        Ok(())
    }

    fn copy_blocks(&self, device: &Path, image: &Path, blocks: u64) -> MbResult<()> {
        self.record(OpCall::CopyBlocks {
            device: device.to_path_buf(),
            image: image.to_path_buf(),
            blocks,
        });
        placeholder(image)
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> MbResult<()> {
        self.record(OpCall::CopyFile {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
        });
        fs::copy(src, dst)?;
        Ok(())
    }

    fn create_file(&self, path: &Path) -> MbResult<()> {
        self.record(OpCall::CreateFile {
            path: path.to_path_buf(),
        });
        placeholder(path)
    }
}

// ============================================================================
// SYSFS FIXTURE
// ============================================================================

/// Writes `uevent` files below a `class/block` directory.
pub struct SysfsFixture {
    class_block: PathBuf,
}

impl SysfsFixture {
    pub fn new(class_block: impl Into<PathBuf>) -> Self {
        let class_block = class_block.into();
        fs::create_dir_all(&class_block).expect("Failed to create class/block");
        Self { class_block }
    }

    pub fn add_disk(&self, devname: &str, major: u32, minor: u32) -> &Self {
        self.write(
            devname,
            format!("MAJOR={}\nMINOR={}\nDEVNAME={}\nDEVTYPE=disk\n", major, minor, devname),
        );
        self
    }

    pub fn add_partition(
        &self,
        devname: &str,
        major: u32,
        minor: u32,
        partn: u32,
        partname: Option<&str>,
    ) -> &Self {
        let mut uevent = format!(
            "MAJOR={}\nMINOR={}\nDEVNAME={}\nDEVTYPE=partition\nPARTN={}\n",
            major, minor, devname, partn
        );
        if let Some(name) = partname {
            uevent.push_str(&format!("PARTNAME={}\n", name));
        }
        self.write(devname, uevent);
        self
    }

    fn write(&self, devname: &str, uevent: String) {
        let dir = self.class_block.join(devname);
        fs::create_dir_all(&dir).expect("Failed to create device dir");
        fs::write(dir.join("uevent"), uevent).expect("Failed to write uevent");
    }
}

// ============================================================================
// PROBE AND UEVENTS
// ============================================================================

/// Resolves partition UUIDs from a fixed table.
#[derive(Default)]
pub struct FakeProbe {
    table: Mutex<HashMap<String, String>>,
    calls: AtomicUsize,
}

impl FakeProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `guid` resolve to the device named `devname` (once it's cataloged).
    pub fn with(self, guid: &str, devname: &str) -> Self {
        self.table
            .lock()
            .insert(guid.to_ascii_lowercase(), devname.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PartUuidProbe for FakeProbe {
    fn find(&self, devices: &[UeventBlockDevice], guid: &str) -> MbResult<Option<usize>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let table = self.table.lock();
        let Some(devname) = table.get(&guid.to_ascii_lowercase()) else {
            return Ok(None);
        };
        Ok(devices.iter().position(|d| &d.devname == devname))
    }
}

/// Uevent source driven by the test through a channel.
pub struct ChannelUevents {
    rx: mpsc::UnboundedReceiver<()>,
}

impl ChannelUevents {
    pub fn new() -> (mpsc::UnboundedSender<()>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }
}

#[async_trait]
impl UeventSource for ChannelUevents {
    async fn next_event(&mut self) -> MbResult<()> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| MbError::Resolution("uevent channel closed".to_string()))
    }
}

// ============================================================================
// TEST TREE
// ============================================================================

/// Temp directory holding the private tree and a fake initramfs root.
pub struct TestTree {
    pub root: PathBuf,
    pub system_root: PathBuf,
    pub layout: MultibootLayout,
    _temp_dir: TempDir, // Dropped after test
}

impl TestTree {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let root = temp_dir.path().join("multiboot");
        let system_root = temp_dir.path().join("system");
        fs::create_dir_all(&root).expect("Failed to create root");
        fs::create_dir_all(&system_root).expect("Failed to create system root");
        Self {
            layout: MultibootLayout::new(&root),
            root,
            system_root,
            _temp_dir: temp_dir,
        }
    }

    pub fn sysfs(&self) -> SysfsFixture {
        SysfsFixture::new(self.layout.sys_class_block())
    }

    /// Write a file relative to the initramfs root.
    pub fn write_system_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.system_root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent");
        }
        fs::write(&path, content).expect("Failed to write system file");
        path
    }

    /// Write a file relative to the boot volume mount.
    pub fn write_bootdev_file(&self, path: &str, content: &str) -> PathBuf {
        let path = self.layout.on_bootdev(Path::new(path));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent");
        }
        fs::write(&path, content).expect("Failed to write bootdev file");
        path
    }

    /// Configuration with every path inside the temp directory.
    pub fn config(&self) -> InitConfig {
        InitConfig {
            root: self.root.clone(),
            system_root: self.system_root.clone(),
            cmdline: Some(self.system_root.join("cmdline")),
            multiboot_fstab: self.system_root.join("multiboot.fstab"),
            init: self.system_root.join("init"),
            recovery_marker: self.system_root.join("sbin/recovery"),
            fuse_node: self.root.join("fuse"),
            ..InitConfig::default()
        }
    }
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}
