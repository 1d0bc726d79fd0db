//! Boot context: the aggregate built up by the bootstrap sequence.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::block::{BlockCatalog, DevKey};
use crate::cmdline::BootSelector;
use crate::config::MultibootPartition;
use crate::fstab::{Fstab, FstabRecord};
use crate::registry::ReplacementRegistry;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootMode {
    /// Booting into recovery rather than the platform
    pub recovery: bool,
    /// A ROM was selected on the command line
    pub multiboot: bool,
}

impl BootMode {
    pub fn detect(recovery_marker: &Path, selector: Option<&BootSelector>) -> Self {
        Self {
            recovery: recovery_marker.exists(),
            multiboot: selector.is_some(),
        }
    }

    /// Recovery of the device's own system; shared storage must stay unmountable.
    pub fn is_native_recovery(&self) -> bool {
        self.recovery && !self.multiboot
    }

    /// The ESP stays mounted only for multiboot recovery.
    pub fn keeps_esp_mounted(&self) -> bool {
        self.recovery && self.multiboot
    }
}

/// Everything later boot stages need to know about this boot.
///
/// Devices are referenced by [`DevKey`] into `catalog`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BootContext {
    pub selector: Option<BootSelector>,
    pub hardware: String,
    pub slot_suffix: Option<String>,
    pub mode: BootMode,
    pub catalog: BlockCatalog,
    /// Device fstab with multiboot/UEFI tags
    pub mbfstab: Fstab,
    /// fstab of the ROM being booted
    pub romfstab: Fstab,
    pub esp: FstabRecord,
    pub esp_device: DevKey,
    pub bootdev: Option<DevKey>,
    pub bootdev_supports_bind: bool,
    pub partitions: Vec<MultibootPartition>,
    pub replacements: ReplacementRegistry,
}
