//! Per-ROM partition mapping (`multiboot.ini`).
//!
//! ```ini
//! [partitions]
//! system = system.img   ; LOOP: attached directly
//! cache  = cache        ; BIND: directory on the boot volume
//! ```
//!
//! The file is read twice. The first pass counts the partition entries, the
//! second fills exactly that many slots; any disagreement between the two
//! passes means the file changed underneath us and is fatal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use mbinit_shared::constants::PARTITIONS_SECTION;
use mbinit_shared::errors::{MbError, MbResult};
use serde::{Deserialize, Serialize};

use crate::block::{BlockCatalog, DevKey, UeventBlockDevice};
use crate::fstab::Fstab;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// Directory on the boot volume, exposed through a growth-backed stub image
    Bind,
    /// Image file attached to a loop device
    Loop,
}

impl PartitionKind {
    /// `.img` suffix (exact, case-sensitive) means LOOP, anything else BIND.
    pub fn classify(path: &str) -> Self {
        if path.ends_with(".img") {
            Self::Loop
        } else {
            Self::Bind
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultibootPartition {
    pub name: String,
    /// Backing path as configured, relative to the configuration file
    pub path: PathBuf,
    pub kind: PartitionKind,
    /// Catalog device this partition replaces
    pub device: DevKey,
}

/// Walk `name = value` entries of an INI document.
///
/// Supports `[section]` headers, `=` or `:` separators, full-line `;`/`#`
/// comments and inline ` ;` comments.
pub fn for_each_entry<F>(content: &str, mut f: F) -> MbResult<()>
where
    F: FnMut(&str, &str, &str) -> MbResult<()>,
{
    let mut section = String::new();

    for (lineno, raw) in content.lines().enumerate() {
        let line = strip_inline_comment(raw).trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| {
                MbError::Config(format!("line {}: unterminated section header", lineno + 1))
            })?;
            section = name.trim().to_string();
            continue;
        }

        let Some(sep) = line.find(['=', ':']) else {
            return Err(MbError::Config(format!(
                "line {}: expected 'name = value': '{}'",
                lineno + 1,
                line
            )));
        };
        let name = line[..sep].trim();
        let value = line[sep + 1..].trim();
        if name.is_empty() || value.is_empty() {
            return Err(MbError::Config(format!(
                "line {}: invalid name/value '{}'",
                lineno + 1,
                line
            )));
        }

        f(&section, name, value)?;
    }

    Ok(())
}

fn strip_inline_comment(line: &str) -> &str {
    match line.find(" ;").or_else(|| line.find("\t;")) {
        Some(pos) => &line[..pos],
        None => line,
    }
}

/// Parses and validates the partition mapping against the device fstab.
pub struct ConfigLoader<'a> {
    catalog: &'a BlockCatalog,
    fstab: &'a Fstab,
    bootdev_supports_bind: bool,
}

impl<'a> ConfigLoader<'a> {
    pub fn new(catalog: &'a BlockCatalog, fstab: &'a Fstab, bootdev_supports_bind: bool) -> Self {
        Self {
            catalog,
            fstab,
            bootdev_supports_bind,
        }
    }

    pub fn load(&self, path: &Path) -> MbResult<Vec<MultibootPartition>> {
        let capacity = count_partitions(&read_config(path)?)
            .map_err(|e| MbError::Config(format!("Can't count partitions in {}: {}", path.display(), e)))?;
        tracing::debug!(path = %path.display(), capacity, "Counted partitions");

        let partitions = self.fill(capacity, &read_config(path)?)?;
        self.check_coverage(&partitions)?;
        Ok(partitions)
    }

    /// Second pass: build exactly `capacity` partitions from `content`.
    ///
    /// `capacity` comes from a first pass over the file; content that
    /// disagrees with it (the file changed in between) is rejected.
    pub fn fill(&self, capacity: usize, content: &str) -> MbResult<Vec<MultibootPartition>> {
        let mut partitions: Vec<MultibootPartition> = Vec::with_capacity(capacity);
        let mut names = HashSet::new();
        for_each_entry(content, |section, name, value| {
            if section != PARTITIONS_SECTION {
                return Ok(());
            }
            if partitions.len() >= capacity {
                return Err(MbError::Config(format!(
                    "Too many partitions: {}>={}",
                    partitions.len(),
                    capacity
                )));
            }
            if !names.insert(name.to_string()) {
                return Err(MbError::Config(format!("Duplicate partition '{}'", name)));
            }

            let part = self.partition(name, value)?;
            if let Some(other) = partitions.iter().find(|p| p.device == part.device) {
                return Err(MbError::Config(format!(
                    "Partitions '{}' and '{}' both replace device {}",
                    other.name, part.name, part.device
                )));
            }
            partitions.push(part);
            Ok(())
        })?;

        if partitions.len() != capacity {
            return Err(MbError::Config(format!(
                "retrieved wrong number of partitions {}/{}",
                partitions.len(),
                capacity
            )));
        }
        Ok(partitions)
    }

    fn partition(&self, name: &str, value: &str) -> MbResult<MultibootPartition> {
        let kind = PartitionKind::classify(value);

        if kind == PartitionKind::Bind && !self.bootdev_supports_bind {
            return Err(MbError::Policy(format!(
                "Boot device doesn't support bind mounts (partition {})",
                name
            )));
        }

        let record = self.fstab.by_name(name);
        if let Some(rec) = record {
            if rec.uefi && !rec.multiboot {
                return Err(MbError::Policy(format!(
                    "UEFI partition {} can't be replaced from the configuration",
                    name
                )));
            }
            if kind == PartitionKind::Bind && rec.is_raw() {
                return Err(MbError::Policy(format!(
                    "raw device {} doesn't support bind mounts",
                    rec.blk_device
                )));
            }
        }

        let device = self.resolve(name, record.map(|r| r.blk_device.as_str()))?;
        tracing::debug!(
            name,
            path = value,
            kind = ?kind,
            device = %device.devname,
            "Configured partition"
        );

        Ok(MultibootPartition {
            name: name.to_string(),
            path: PathBuf::from(value),
            kind,
            device: device.key,
        })
    }

    /// fstab device path, then GPT partition name, then kernel device name.
    fn resolve(&self, name: &str, fstab_device: Option<&str>) -> MbResult<&'a UeventBlockDevice> {
        fstab_device
            .and_then(|path| self.catalog.lookup_by_path(path))
            .or_else(|| self.catalog.lookup_by_partname(name))
            .or_else(|| self.catalog.lookup_by_devname(name))
            .ok_or_else(|| {
                MbError::Resolution(format!("Can't find block device for partition {}", name))
            })
    }

    /// Every multiboot-tagged fstab record needs a configured replacement.
    fn check_coverage(&self, partitions: &[MultibootPartition]) -> MbResult<()> {
        for rec in self.fstab.records.iter().filter(|r| r.multiboot) {
            if !partitions.iter().any(|p| p.name == rec.name()) {
                return Err(MbError::Config(format!(
                    "Can't find multiboot partition for '{}'",
                    rec.mount_point
                )));
            }
        }
        Ok(())
    }
}

fn read_config(path: &Path) -> MbResult<String> {
    std::fs::read_to_string(path)
        .map_err(|e| MbError::Config(format!("Can't read {}: {}", path.display(), e)))
}

fn count_partitions(content: &str) -> MbResult<usize> {
    let mut count = 0;
    for_each_entry(content, |section, _, _| {
        if section == PARTITIONS_SECTION {
            count += 1;
        }
        Ok(())
    })?;
    Ok(count)
}
