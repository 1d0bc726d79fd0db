//! Kernel command line.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use mbinit_shared::constants::cmdline as keys;
use mbinit_shared::constants::selector::{GPT_ID_LEN, MBR_ID_LEN};
use mbinit_shared::errors::{MbError, MbResult};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Gpt,
    Mbr,
}

impl TableKind {
    fn id_len(self) -> usize {
        match self {
            Self::Gpt => GPT_ID_LEN,
            Self::Mbr => MBR_ID_LEN,
        }
    }
}

/// Selected ROM: `<GPT|MBR>,<identifier>,<path>`.
///
/// `id` names the boot volume by partition UUID, `path` is the ROM's
/// configuration file relative to that volume's root.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSelector {
    pub table: TableKind,
    pub id: String,
    pub path: PathBuf,
}

impl BootSelector {
    /// Directory holding the configuration file; partition paths are relative to it.
    pub fn config_dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("/"))
    }
}

impl FromStr for BootSelector {
    type Err = MbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.splitn(3, ',');
        let table = match fields.next() {
            Some("GPT") => TableKind::Gpt,
            Some("MBR") => TableKind::Mbr,
            other => {
                return Err(MbError::Config(format!(
                    "invalid partition table type {:?} in '{}'",
                    other.unwrap_or_default(),
                    s
                )))
            }
        };

        let id = fields.next().unwrap_or_default();
        if id.len() != table.id_len() {
            return Err(MbError::Config(format!(
                "invalid {:?} identifier '{}' (expected {} characters)",
                table,
                id,
                table.id_len()
            )));
        }

        let path = fields.next().unwrap_or_default();
        if path.is_empty() {
            return Err(MbError::Config(format!("missing path in '{}'", s)));
        }

        Ok(Self {
            table,
            id: id.to_string(),
            path: PathBuf::from(path),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KernelCmdline {
    pub selector: Option<BootSelector>,
    pub hardware: Option<String>,
    pub slot_suffix: Option<String>,
    pub debug_level: Option<u8>,
}

impl KernelCmdline {
    pub fn parse(content: &str) -> MbResult<Self> {
        let mut cmdline = Self::default();

        for token in content.split_whitespace() {
            let Some((key, value)) = token.split_once('=') else {
                continue;
            };
            match key {
                "" => continue,
                keys::MULTIBOOT_PATH => cmdline.selector = Some(value.parse()?),
                keys::HARDWARE => cmdline.hardware = Some(value.to_string()),
                keys::SLOT_SUFFIX => cmdline.slot_suffix = Some(value.to_string()),
                keys::DEBUG => match value.parse::<u8>() {
                    Ok(level) => cmdline.debug_level = Some(level),
                    Err(_) => tracing::warn!("Ignoring invalid {}={}", keys::DEBUG, value),
                },
                _ => {}
            }
        }

        Ok(cmdline)
    }

    pub fn read(path: &Path) -> MbResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MbError::Config(format!("Can't read {}: {}", path.display(), e))
        })?;
        Self::parse(&content)
    }

    /// Hardware name, required to locate the ROM fstab.
    pub fn require_hardware(&self) -> MbResult<&str> {
        self.hardware
            .as_deref()
            .ok_or_else(|| MbError::Config(format!("{} is not set", keys::HARDWARE)))
    }
}
