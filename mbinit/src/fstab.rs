//! Android fs_mgr fstab tables.
//!
//! Record format:
//! `<blk_device> <mount_point> <fs_type> <mnt_flags,options> <fs_mgr_flags>`

use std::path::{Path, PathBuf};

use mbinit_shared::constants::fs::RAW;
use mbinit_shared::errors::{MbError, MbResult};
use nix::mount::MsFlags;
use serde::{Deserialize, Serialize};

use crate::block::{BlockCatalog, DevKey};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FstabRecord {
    pub blk_device: String,
    pub mount_point: String,
    pub fs_type: String,
    /// `MsFlags` bits
    pub flags: u64,
    /// Filesystem-specific mount options (the unrecognised mount flags)
    pub fs_options: Option<String>,
    pub uefi: bool,
    pub multiboot: bool,
    /// Backup directory on the ESP: `/<dir>` or `datamedia`
    pub esp: Option<String>,
    /// fs_mgr flags not interpreted here
    pub fs_mgr_flags: Vec<String>,
}

impl FstabRecord {
    pub fn ms_flags(&self) -> MsFlags {
        MsFlags::from_bits_truncate(self.flags as nix::libc::c_ulong)
    }

    /// Mount point without the leading `/`, e.g. `system`.
    pub fn name(&self) -> &str {
        self.mount_point.strip_prefix('/').unwrap_or(&self.mount_point)
    }

    pub fn is_raw(&self) -> bool {
        self.fs_type == RAW
    }

    fn parse_line(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            return None;
        }

        let (flags, fs_options) = parse_mount_flags(fields[3]);
        let mut record = Self {
            blk_device: fields[0].to_string(),
            mount_point: fields[1].to_string(),
            fs_type: fields[2].to_string(),
            flags: flags.bits() as u64,
            fs_options,
            uefi: false,
            multiboot: false,
            esp: None,
            fs_mgr_flags: Vec::new(),
        };

        for flag in fields[4].split(',').filter(|f| !f.is_empty()) {
            match flag {
                "uefi" => record.uefi = true,
                "multiboot" => record.multiboot = true,
                _ => match flag.strip_prefix("esp=") {
                    Some(dir) => record.esp = Some(dir.to_string()),
                    None => record.fs_mgr_flags.push(flag.to_string()),
                },
            }
        }

        Some(record)
    }
}

fn parse_mount_flags(field: &str) -> (MsFlags, Option<String>) {
    let mut flags = MsFlags::empty();
    let mut options = Vec::new();

    for opt in field.split(',').filter(|o| !o.is_empty()) {
        let flag = match opt {
            "defaults" => MsFlags::empty(),
            "ro" => MsFlags::MS_RDONLY,
            "nosuid" => MsFlags::MS_NOSUID,
            "nodev" => MsFlags::MS_NODEV,
            "noexec" => MsFlags::MS_NOEXEC,
            "sync" => MsFlags::MS_SYNCHRONOUS,
            "noatime" => MsFlags::MS_NOATIME,
            "nodiratime" => MsFlags::MS_NODIRATIME,
            "relatime" => MsFlags::MS_RELATIME,
            "remount" => MsFlags::MS_REMOUNT,
            "bind" => MsFlags::MS_BIND,
            "rec" => MsFlags::MS_REC,
            "private" => MsFlags::MS_PRIVATE,
            other => {
                options.push(other);
                continue;
            }
        };
        flags |= flag;
    }

    let options = if options.is_empty() {
        None
    } else {
        Some(options.join(","))
    };
    (flags, options)
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fstab {
    /// Source file, `None` for the empty fallback table.
    pub path: Option<PathBuf>,
    pub records: Vec<FstabRecord>,
}

impl Fstab {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(content: &str) -> MbResult<Self> {
        let mut records = Vec::new();
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let record = FstabRecord::parse_line(line).ok_or_else(|| {
                MbError::Config(format!("fstab line {}: expected 5 fields: '{}'", lineno + 1, line))
            })?;
            records.push(record);
        }
        Ok(Self {
            path: None,
            records,
        })
    }

    pub fn read(path: &Path) -> MbResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MbError::Config(format!("Can't read {}: {}", path.display(), e)))?;
        let mut fstab = Self::parse(&content)
            .map_err(|e| MbError::Config(format!("{}: {}", path.display(), e)))?;
        fstab.path = Some(path.to_path_buf());
        Ok(fstab)
    }

    pub fn by_name(&self, name: &str) -> Option<&FstabRecord> {
        self.records.iter().find(|r| r.name() == name)
    }

    pub fn by_mount_point(&self, mount_point: &str) -> Option<&FstabRecord> {
        self.records.iter().find(|r| r.mount_point == mount_point)
    }

    /// The record marked with `esp=`.
    pub fn esp(&self) -> Option<&FstabRecord> {
        self.records.iter().find(|r| r.esp.is_some())
    }

    /// First record whose block device resolves to `key` in the catalog.
    pub fn by_device(&self, catalog: &BlockCatalog, key: DevKey) -> Option<&FstabRecord> {
        self.records.iter().find(|r| {
            catalog
                .lookup_by_path(&r.blk_device)
                .is_some_and(|d| d.key == key)
        })
    }

    pub fn uefi_records(&self) -> impl Iterator<Item = &FstabRecord> {
        self.records.iter().filter(|r| r.uefi)
    }

    /// UEFI partitions are backed up as whole-partition images, so they must
    /// not carry a filesystem type.
    pub fn validate_uefi_raw(&self) -> MbResult<()> {
        if let Some(rec) = self.uefi_records().find(|r| !r.is_raw()) {
            return Err(MbError::Config(format!(
                "UEFI partition {} has fs type '{}', expected '{}'",
                rec.mount_point, rec.fs_type, RAW
            )));
        }
        Ok(())
    }

    /// Locate the running ROM's fstab below `system_root`.
    ///
    /// Tries `fstab.<hardware>`, `etc/twrp.fstab` and `etc/recovery.fstab` in
    /// order; falls back to an empty table.
    pub fn resolve_rom_fstab(system_root: &Path, hardware: &str) -> Self {
        let candidates = [
            system_root.join(format!("fstab.{}", hardware)),
            system_root.join("etc/twrp.fstab"),
            system_root.join("etc/recovery.fstab"),
        ];

        for candidate in &candidates {
            if !candidate.exists() {
                continue;
            }
            match Self::read(candidate) {
                Ok(fstab) => {
                    tracing::info!(path = %candidate.display(), "Using ROM fstab");
                    return fstab;
                }
                Err(e) => tracing::warn!("Ignoring unusable ROM fstab: {}", e),
            }
        }

        tracing::warn!("No ROM fstab found, continuing with an empty table");
        Self::empty()
    }
}
