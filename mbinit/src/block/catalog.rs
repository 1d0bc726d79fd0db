//! Block device catalog.
//!
//! Ingests the kernel's block-device enumeration (one `uevent` file per device
//! below `/sys/class/block`) and answers identity lookups. The catalog only
//! ever grows: a rescan appends devices it has not seen before and never drops
//! or rewrites an existing entry.

use std::fmt;
use std::path::{Path, PathBuf};

use mbinit_shared::errors::{MbError, MbResult};
use serde::{Deserialize, Serialize};

use super::nodes::NodeBuilder;
use super::probe::PartUuidProbe;

/// Device number pair, the identity used across the agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DevKey {
    pub major: u32,
    pub minor: u32,
}

impl DevKey {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for DevKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockKind {
    Disk,
    Partition,
    Unknown,
}

/// One entry of the enumeration feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UeventRecord {
    pub devname: String,
    pub key: DevKey,
    pub partn: Option<u32>,
    pub partname: Option<String>,
    pub kind: BlockKind,
}

impl UeventRecord {
    /// Parse the body of a sysfs `uevent` file.
    ///
    /// Returns `None` when DEVNAME, MAJOR or MINOR is missing or malformed.
    pub fn parse(content: &str) -> Option<Self> {
        let mut devname = None;
        let mut major = None;
        let mut minor = None;
        let mut partn = None;
        let mut partname = None;
        let mut kind = BlockKind::Unknown;

        for line in content.lines() {
            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            match name.trim() {
                "MAJOR" => major = value.parse::<u32>().ok(),
                "MINOR" => minor = value.parse::<u32>().ok(),
                "PARTN" => partn = value.parse::<u32>().ok(),
                "DEVNAME" => devname = Some(value.to_string()),
                "PARTNAME" => partname = Some(value.to_string()),
                "DEVTYPE" => {
                    kind = match value {
                        "disk" => BlockKind::Disk,
                        "partition" => BlockKind::Partition,
                        _ => BlockKind::Unknown,
                    }
                }
                _ => {}
            }
        }

        Some(Self {
            devname: devname?,
            key: DevKey::new(major?, minor?),
            partn,
            partname,
            kind,
        })
    }
}

/// Catalog entry. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UeventBlockDevice {
    pub devname: String,
    pub key: DevKey,
    pub partn: Option<u32>,
    pub partname: Option<String>,
    pub kind: BlockKind,
    /// Position in discovery order (0 = first device ever seen).
    pub order: usize,
}

/// Source of block-device enumeration records.
pub trait BlockFeed {
    fn scan(&self) -> MbResult<Vec<UeventRecord>>;
}

/// Reads `<dir>/<device>/uevent` for every entry of a sysfs `class/block` dir.
pub struct SysfsFeed {
    class_block: PathBuf,
}

impl SysfsFeed {
    pub fn new(class_block: impl Into<PathBuf>) -> Self {
        Self {
            class_block: class_block.into(),
        }
    }
}

impl BlockFeed for SysfsFeed {
    fn scan(&self) -> MbResult<Vec<UeventRecord>> {
        let entries = std::fs::read_dir(&self.class_block).map_err(|e| {
            MbError::Resolution(format!(
                "Can't open {}: {}",
                self.class_block.display(),
                e
            ))
        })?;

        let mut names: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name())
            .collect();
        names.sort();

        let mut records = Vec::with_capacity(names.len());
        for name in names {
            let uevent = self.class_block.join(&name).join("uevent");
            let content = match std::fs::read_to_string(&uevent) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Can't read {}: {}", uevent.display(), e);
                    continue;
                }
            };
            match UeventRecord::parse(&content) {
                Some(record) => records.push(record),
                None => tracing::warn!("Incomplete uevent in {}", uevent.display()),
            }
        }

        Ok(records)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BlockCatalog {
    devices: Vec<UeventBlockDevice>,
}

impl BlockCatalog {
    /// Build the catalog from one pass over the feed.
    pub fn build(feed: &dyn BlockFeed) -> MbResult<Self> {
        let mut catalog = Self::default();
        catalog.ingest(feed.scan()?);
        tracing::debug!(devices = catalog.len(), "Built block device catalog");
        Ok(catalog)
    }

    /// Re-read the feed, append unseen devices and refresh the node tree.
    ///
    /// Returns the number of devices added.
    pub fn rescan(&mut self, feed: &dyn BlockFeed, nodes: &dyn NodeBuilder) -> MbResult<usize> {
        let added = self.ingest(feed.scan()?);
        nodes.create_nodes(&self.devices)?;
        if added > 0 {
            tracing::debug!(added, total = self.len(), "Rescan found new block devices");
        }
        Ok(added)
    }

    fn ingest(&mut self, records: Vec<UeventRecord>) -> usize {
        let mut added = 0;
        for record in records {
            if self.by_key(record.key).is_some() {
                continue;
            }
            let order = self.devices.len();
            self.devices.push(UeventBlockDevice {
                devname: record.devname,
                key: record.key,
                partn: record.partn,
                partname: record.partname,
                kind: record.kind,
                order,
            });
            added += 1;
        }
        added
    }

    pub fn devices(&self) -> &[UeventBlockDevice] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn by_key(&self, key: DevKey) -> Option<&UeventBlockDevice> {
        self.devices.iter().find(|d| d.key == key)
    }

    /// Find the device whose partition-table identifier equals `guid`.
    ///
    /// The probe runs isolated and reports back a catalog index, never a
    /// reference into its own copy of the catalog.
    pub fn lookup_by_guid(
        &self,
        probe: &dyn PartUuidProbe,
        guid: &str,
    ) -> MbResult<Option<&UeventBlockDevice>> {
        let Some(index) = probe.find(&self.devices, guid)? else {
            return Ok(None);
        };
        self.devices.get(index).map(Some).ok_or_else(|| {
            MbError::Internal(format!(
                "probe returned index {} for a catalog of {} devices",
                index,
                self.devices.len()
            ))
        })
    }

    /// Match on the GPT partition name.
    pub fn lookup_by_partname(&self, name: &str) -> Option<&UeventBlockDevice> {
        self.devices
            .iter()
            .find(|d| d.partname.as_deref() == Some(name))
    }

    /// Match on the kernel device name (e.g. `mmcblk0p12`).
    pub fn lookup_by_devname(&self, name: &str) -> Option<&UeventBlockDevice> {
        self.devices.iter().find(|d| d.devname == name)
    }

    /// Resolve an fstab device path.
    ///
    /// `.../by-name/<partname>` paths match on the partition name, everything
    /// else must be `/dev/block/<devname>`, optionally below a private root.
    pub fn lookup_by_path(&self, path: &str) -> Option<&UeventBlockDevice> {
        if path.contains("by-name") {
            let name = Path::new(path).file_name()?.to_str()?;
            return self.lookup_by_partname(name);
        }

        const PREFIX: &str = "/dev/block/";
        let start = path.find(PREFIX)?;
        self.lookup_by_devname(&path[start + PREFIX.len()..])
    }
}
