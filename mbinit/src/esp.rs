//! EFI system partition.
//!
//! UEFI partitions are backed up as whole-partition images into a directory
//! on the ESP and replaced by loop devices over those images.

use std::path::{Path, PathBuf};

use mbinit_shared::constants::ESP_DATAMEDIA;
use mbinit_shared::errors::{MbError, MbResult};
use mbinit_shared::layout::names::UEFI_BACKUP_DIR;
use mbinit_shared::MultibootLayout;
use nix::mount::MsFlags;

use crate::block::{BlockCatalog, UeventBlockDevice};
use crate::fstab::Fstab;
use crate::storage::SystemOps;

/// Backup directory below the mounted ESP for an `esp=` value.
///
/// `/<dir>` maps to `<esp>/<dir>/UEFIESP`. `datamedia` maps to
/// `<esp>/media/UEFIESP`, or to `<esp>/media/0/UEFIESP` for multi-user data
/// layouts that don't have the former yet.
pub fn backup_dir(esp_mount: &Path, esp: &str) -> MbResult<PathBuf> {
    if let Some(dir) = esp.strip_prefix('/') {
        return Ok(esp_mount.join(dir).join(UEFI_BACKUP_DIR));
    }
    if esp != ESP_DATAMEDIA {
        return Err(MbError::Config(format!("Invalid ESP path {}", esp)));
    }

    let media = esp_mount.join("media");
    let dir = media.join(UEFI_BACKUP_DIR);
    if !dir.is_dir() && media.join("0").is_dir() {
        return Ok(media.join("0").join(UEFI_BACKUP_DIR));
    }
    Ok(dir)
}

/// Backup image of partition `name` inside the backup directory.
pub fn backup_image(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("partition_{}.img", name))
}

/// Mount the ESP, preferring the ROM's mount options for that device.
pub fn mount(
    ops: &dyn SystemOps,
    layout: &MultibootLayout,
    catalog: &BlockCatalog,
    device: &UeventBlockDevice,
    romfstab: &Fstab,
) -> MbResult<()> {
    let node = layout.block_node(&device.devname);
    let target = layout.esp_dir();

    let (flags, data) = match romfstab.by_device(catalog, device.key) {
        Some(rec) => {
            tracing::debug!(
                "Using ROM mount flags for ESP: {:?}, data: {:?}",
                rec.ms_flags(),
                rec.fs_options
            );
            (rec.ms_flags(), rec.fs_options.as_deref())
        }
        None => (MsFlags::empty(), None),
    };

    if let Err(e) = ops.mount(&node, &target, None, flags, data) {
        if flags.is_empty() && data.is_none() {
            return Err(e);
        }
        tracing::info!("Mounting ESP without flags ({})", e);
        ops.mount(&node, &target, None, MsFlags::empty(), None)?;
    }
    Ok(())
}
