//! Replacement planner.
//!
//! Provisions loop devices, growth stores and backup images for every
//! replaced partition, strictly in configuration order. Any failure aborts
//! the whole boot; nothing is rolled back.

use std::path::{Path, PathBuf};

use mbinit_shared::constants::block::{FUSE_MAJOR, FUSE_MINOR, GROWTH_CAP_BLOCKS};
use mbinit_shared::constants::fs::DEFAULT_STUB_FS;
use mbinit_shared::errors::{MbError, MbResult};
use mbinit_shared::MultibootLayout;
use nix::mount::MsFlags;

use crate::block::{BlockCatalog, DevKey, UeventBlockDevice};
use crate::config::{MultibootPartition, PartitionKind};
use crate::context::BootMode;
use crate::esp;
use crate::fstab::Fstab;
use crate::registry::{PartitionReplacement, ReplacementOrigin, ReplacementRegistry};
use crate::storage::{LoopAllocator, SystemOps};
use crate::watchdog::Deadline;

/// Size of a BIND partition's growth store, in 512-byte sectors.
///
/// The store is lazily backed, the cap only bounds filesystem creation time.
pub fn growth_blocks(device_blocks: u64) -> u64 {
    device_blocks.min(GROWTH_CAP_BLOCKS)
}

pub struct ReplacementPlanner<'a> {
    layout: &'a MultibootLayout,
    ops: &'a dyn SystemOps,
    loops: LoopAllocator,
    fuse_node: PathBuf,
    deadline: Option<Deadline>,
}

impl<'a> ReplacementPlanner<'a> {
    pub fn new(layout: &'a MultibootLayout, ops: &'a dyn SystemOps, fuse_node: impl Into<PathBuf>) -> Self {
        Self {
            layout,
            ops,
            loops: LoopAllocator::new(),
            fuse_node: fuse_node.into(),
            deadline: None,
        }
    }

    /// Check `deadline` before provisioning each partition.
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn loops(&self) -> &LoopAllocator {
        &self.loops
    }

    /// Provision the configured partitions of the selected ROM.
    ///
    /// Backing paths are relative to `config_dir` on the boot volume.
    pub fn plan_multiboot(
        &mut self,
        config_dir: &Path,
        partitions: &[MultibootPartition],
        catalog: &BlockCatalog,
        registry: &mut ReplacementRegistry,
    ) -> MbResult<()> {
        self.ensure_fuse_node()?;

        for part in partitions {
            self.check_deadline(&part.name)?;
            let device = catalog.by_key(part.device).ok_or_else(|| {
                MbError::Internal(format!("partition {} lost its device {}", part.name, part.device))
            })?;
            let partpath = self.layout.on_bootdev(&config_dir.join(&part.path));
            let loop_device = self.layout.loop_node(&part.name);

            check_existing(&partpath, part.kind)?;

            tracing::info!(
                name = %part.name,
                kind = ?part.kind,
                path = %partpath.display(),
                "Setting up partition replacement"
            );

            let (loop_key, loop_file) = match part.kind {
                PartitionKind::Bind => {
                    let key = self.setup_bind(part, device, &partpath, &loop_device)?;
                    (key, None)
                }
                PartitionKind::Loop => {
                    let key = self.loops.allocate(self.ops, &loop_device)?;
                    self.attach(&loop_device, &partpath)?;
                    (key, Some(partpath.clone()))
                }
            };

            registry.insert(PartitionReplacement::new(
                device.key,
                loop_device,
                loop_key,
                loop_file,
                ReplacementOrigin::Multiboot {
                    name: part.name.clone(),
                    kind: part.kind,
                    partpath,
                },
                true,
            ))?;
        }

        Ok(())
    }

    /// Replace UEFI partitions by loop devices over whole-partition backups.
    ///
    /// Partitions already replaced by the ROM's configuration are skipped.
    /// In native recovery the loop runs over a private copy so the ESP can be
    /// unmounted; the copy is synced back to `sync_target` later. Loops are
    /// attached right away in recovery and deferred otherwise.
    pub fn plan_uefi(
        &mut self,
        backup_dir: &Path,
        mbfstab: &Fstab,
        catalog: &BlockCatalog,
        mode: BootMode,
        registry: &mut ReplacementRegistry,
    ) -> MbResult<()> {
        if !backup_dir.is_dir() {
            std::fs::create_dir_all(backup_dir).map_err(|e| {
                MbError::DeviceSetup(format!(
                    "Can't create directory at {}: {}",
                    backup_dir.display(),
                    e
                ))
            })?;
        }

        for rec in mbfstab.uefi_records() {
            let name = rec.name();
            self.check_deadline(name)?;
            let device = catalog.lookup_by_path(&rec.blk_device).ok_or_else(|| {
                MbError::Resolution(format!("Can't find block device {}", rec.blk_device))
            })?;

            if registry.contains(device.key) {
                tracing::debug!(name, "Already replaced by the ROM, skipping backup");
                continue;
            }

            let image = esp::backup_image(backup_dir, name);
            self.ensure_backup(device, &image)?;

            let (loop_file, sync_target) = if mode.is_native_recovery() {
                let private = self.layout.private_loopfile(name);
                self.ops.copy_file(&image, &private)?;
                (private, Some(name.to_string()))
            } else {
                (image, None)
            };

            let loop_device = self.layout.loop_node(name);
            let loop_key = self.loops.allocate(self.ops, &loop_device)?;
            if mode.recovery {
                self.attach(&loop_device, &loop_file)?;
            }

            let mut replacement = PartitionReplacement::new(
                device.key,
                loop_device,
                loop_key,
                Some(loop_file),
                ReplacementOrigin::Uefi {
                    name: name.to_string(),
                },
                mode.recovery,
            );
            if let Some(target) = sync_target {
                replacement = replacement.with_sync_target(target);
            }
            registry.insert(replacement)?;
        }

        Ok(())
    }

    fn setup_bind(
        &mut self,
        part: &MultibootPartition,
        device: &UeventBlockDevice,
        partpath: &Path,
        loop_device: &Path,
    ) -> MbResult<DevKey> {
        if !partpath.exists() {
            std::fs::create_dir_all(partpath).map_err(|e| {
                MbError::DeviceSetup(format!(
                    "Can't create directory {}: {}",
                    partpath.display(),
                    e
                ))
            })?;
        }

        let node = self.layout.block_node(&device.devname);
        let device_blocks = self.ops.block_count(&node)?;
        if device_blocks == 0 {
            return Err(MbError::DeviceSetup(format!(
                "Can't get size of device {}",
                node.display()
            )));
        }
        let blocks = growth_blocks(device_blocks);
        tracing::debug!(name = %part.name, device_blocks, blocks, "Sizing growth store");

        let storage = self.layout.growth_storage(&part.name);
        let mountpoint = self.layout.growth_mount(&part.name);
        self.ops
            .mount_growth_store(&storage, &mountpoint, blocks)
            .map_err(|e| MbError::DeviceSetup(format!("Can't mount growth store for {}: {}", part.name, e)))?;

        let key = self.loops.allocate(self.ops, loop_device)?;
        self.attach(loop_device, &self.layout.growth_backing_file(&part.name))?;

        self.ops.make_filesystem(loop_device, DEFAULT_STUB_FS)?;

        let stub = self.layout.stub_dir();
        self.ops
            .mount(loop_device, &stub, Some(DEFAULT_STUB_FS), MsFlags::empty(), None)?;
        self.ops.create_file(&self.layout.stub_idfile())?;
        self.ops.unmount(&stub)?;

        Ok(key)
    }

    fn check_deadline(&self, name: &str) -> MbResult<()> {
        match &self.deadline {
            Some(deadline) => deadline.check(&format!("setting up partition {}", name)),
            None => Ok(()),
        }
    }

    fn attach(&self, loop_device: &Path, file: &Path) -> MbResult<()> {
        self.ops.attach_loop(loop_device, file).map_err(|e| {
            MbError::DeviceSetup(format!(
                "Can't setup loop device at {} for {}: {}",
                loop_device.display(),
                file.display(),
                e
            ))
        })
    }

    fn ensure_fuse_node(&self) -> MbResult<()> {
        if self.fuse_node.exists() {
            return Ok(());
        }
        if let Some(parent) = self.fuse_node.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.ops
            .make_char_node(&self.fuse_node, DevKey::new(FUSE_MAJOR, FUSE_MINOR))
    }

    fn ensure_backup(&self, device: &UeventBlockDevice, image: &Path) -> MbResult<()> {
        if image.exists() {
            tracing::debug!(image = %image.display(), "Reusing partition backup");
            return Ok(());
        }

        let node = self.layout.block_node(&device.devname);
        let blocks = self.ops.block_count(&node)?;
        tracing::info!(
            device = %device.devname,
            image = %image.display(),
            blocks,
            "Creating partition backup"
        );
        self.ops.copy_blocks(&node, image, blocks)
    }
}

/// An existing backing path must match the partition kind.
fn check_existing(partpath: &Path, kind: PartitionKind) -> MbResult<()> {
    let meta = match std::fs::symlink_metadata(partpath) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(MbError::DeviceSetup(format!(
                "Can't stat '{}': {}",
                partpath.display(),
                e
            )))
        }
    };

    let valid = match kind {
        PartitionKind::Bind => meta.is_dir(),
        PartitionKind::Loop => meta.is_file(),
    };
    if !valid {
        return Err(MbError::DeviceSetup(format!(
            "path '{}' ({:?}) has invalid type {:?}",
            partpath.display(),
            kind,
            meta.file_type()
        )));
    }
    Ok(())
}
