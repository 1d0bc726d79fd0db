//! Replacement registry.
//!
//! Append-only, ordered list of partition replacements. Each entry owns its
//! own lock for the later boot stages that attach deferred loops or sync
//! private copies back; bootstrap itself is single-threaded and never
//! contends on them.

use std::path::PathBuf;

use mbinit_shared::errors::{MbError, MbResult};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::block::DevKey;
use crate::config::PartitionKind;

/// Why a partition was replaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplacementOrigin {
    /// Configured in the ROM's partition mapping
    Multiboot {
        name: String,
        kind: PartitionKind,
        /// Backing path on the mounted boot volume
        partpath: PathBuf,
    },
    /// Implicit whole-partition backup of a UEFI partition
    Uefi { name: String },
}

impl ReplacementOrigin {
    pub fn name(&self) -> &str {
        match self {
            Self::Multiboot { name, .. } | Self::Uefi { name } => name,
        }
    }
}

/// Mutable part of a replacement, guarded by its lock.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    /// Loop device already attached to its backing file
    pub attached: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PartitionReplacement {
    /// Device being replaced
    pub key: DevKey,
    pub loop_device: PathBuf,
    /// Loop number of `loop_device`
    pub loop_key: DevKey,
    /// File the loop device is (or will be) attached to
    pub loop_file: Option<PathBuf>,
    /// Mount point name to copy a private loop file back to
    pub sync_target: Option<String>,
    pub origin: ReplacementOrigin,
    state: Mutex<LoopState>,
}

impl PartitionReplacement {
    pub fn new(
        key: DevKey,
        loop_device: PathBuf,
        loop_key: DevKey,
        loop_file: Option<PathBuf>,
        origin: ReplacementOrigin,
        attached: bool,
    ) -> Self {
        Self {
            key,
            loop_device,
            loop_key,
            loop_file,
            sync_target: None,
            origin,
            state: Mutex::new(LoopState { attached }),
        }
    }

    pub fn with_sync_target(mut self, target: impl Into<String>) -> Self {
        self.sync_target = Some(target.into());
        self
    }

    pub fn name(&self) -> &str {
        self.origin.name()
    }

    pub fn lock(&self) -> MutexGuard<'_, LoopState> {
        self.state.lock()
    }

    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ReplacementRegistry {
    entries: Vec<PartitionReplacement>,
}

impl ReplacementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a replacement. A second replacement for the same device is an error.
    pub fn insert(&mut self, replacement: PartitionReplacement) -> MbResult<()> {
        if self.contains(replacement.key) {
            return Err(MbError::Internal(format!(
                "device {} already replaced (by {})",
                replacement.key,
                replacement.name()
            )));
        }
        tracing::debug!(
            name = replacement.name(),
            device = %replacement.key,
            loop_device = %replacement.loop_device.display(),
            "Registered replacement"
        );
        self.entries.push(replacement);
        Ok(())
    }

    pub fn contains(&self, key: DevKey) -> bool {
        self.get(key).is_some()
    }

    pub fn get(&self, key: DevKey) -> Option<&PartitionReplacement> {
        self.entries.iter().find(|r| r.key == key)
    }

    pub fn by_name(&self, name: &str) -> Option<&PartitionReplacement> {
        self.entries.iter().find(|r| r.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PartitionReplacement> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
