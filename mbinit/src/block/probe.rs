//! Partition UUID probe.
//!
//! Probing reads `/sys/class/block` and `/dev/block` at fixed absolute paths,
//! but those only exist inside the private tree. The probe therefore runs in a
//! forked worker that enters a fresh mount namespace and chroots into the
//! private root. The worker answers with a catalog index over a pipe; the
//! caller waits for it to exit and only reads the reply on success.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use mbinit_shared::errors::{MbError, MbResult};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, pipe, ForkResult};
use serde::{Deserialize, Serialize};

use super::catalog::{BlockKind, UeventBlockDevice};
use super::parttable::PartitionTable;

/// Worker exit codes.
const EXIT_FOUND: i32 = 0;
const EXIT_NOT_FOUND: i32 = 1;
const EXIT_FAILED: i32 = 2;

/// Finds the catalog entry whose partition UUID equals a given identifier.
pub trait PartUuidProbe {
    /// Returns the index into `devices` of the match, if any.
    fn find(&self, devices: &[UeventBlockDevice], guid: &str) -> MbResult<Option<usize>>;
}

#[derive(Debug, Serialize, Deserialize)]
struct ProbeReply {
    index: usize,
}

/// Probe executed in a forked, chrooted worker.
pub struct IsolatedProbe {
    root: PathBuf,
}

impl IsolatedProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_worker(&self, devices: &[UeventBlockDevice], guid: &str, reply: OwnedFd) -> MbResult<bool> {
        unshare(CloneFlags::CLONE_NEWNS)
            .map_err(|e| MbError::Resolution(format!("Failed to unshare mount namespace: {}", e)))?;
        chroot(&self.root).map_err(|e| {
            MbError::Resolution(format!("Failed to chroot into {}: {}", self.root.display(), e))
        })?;
        chdir("/").map_err(|e| MbError::Resolution(format!("Failed to chdir to /: {}", e)))?;

        let Some(index) = find_in_tree(Path::new("/"), devices, guid)? else {
            return Ok(false);
        };

        let mut out = File::from(reply);
        serde_json::to_writer(&mut out, &ProbeReply { index })?;
        out.flush()?;
        Ok(true)
    }
}

impl PartUuidProbe for IsolatedProbe {
    fn find(&self, devices: &[UeventBlockDevice], guid: &str) -> MbResult<Option<usize>> {
        let (reader, writer) =
            pipe().map_err(|e| MbError::Resolution(format!("Failed to create probe pipe: {}", e)))?;

        // SAFETY: the agent runs a current-thread runtime, so the child is the
        // only thread and leaves through _exit.
        match unsafe { fork() }
            .map_err(|e| MbError::Resolution(format!("Failed to fork probe worker: {}", e)))?
        {
            ForkResult::Child => {
                drop(reader);
                let code = match self.run_worker(devices, guid, writer) {
                    Ok(true) => EXIT_FOUND,
                    Ok(false) => EXIT_NOT_FOUND,
                    Err(e) => {
                        tracing::error!("Partition probe failed: {}", e);
                        EXIT_FAILED
                    }
                };
                // SAFETY: terminates the forked child without running the
                // parent's atexit handlers or destructors.
                unsafe { nix::libc::_exit(code) }
            }
            ForkResult::Parent { child } => {
                drop(writer);
                let status = waitpid(child, None).map_err(|e| {
                    MbError::Resolution(format!("Failed to wait for probe worker: {}", e))
                })?;

                match status {
                    WaitStatus::Exited(_, EXIT_FOUND) => {
                        let mut payload = String::new();
                        File::from(reader).read_to_string(&mut payload)?;
                        let reply: ProbeReply = serde_json::from_str(&payload)?;
                        if reply.index >= devices.len() {
                            return Err(MbError::Internal(format!(
                                "probe reported index {} out of {}",
                                reply.index,
                                devices.len()
                            )));
                        }
                        Ok(Some(reply.index))
                    }
                    WaitStatus::Exited(_, EXIT_NOT_FOUND) => Ok(None),
                    other => Err(MbError::Resolution(format!(
                        "Partition probe worker failed: {:?}",
                        other
                    ))),
                }
            }
        }
    }
}

/// Search for `guid` below `root`, which must contain `sys/class/block` and
/// `dev/block` for the catalog's devices.
///
/// Each partition's disk is the parent directory of its canonical sysfs entry.
/// Disk tables are read once and cached.
pub fn find_in_tree(
    root: &Path,
    devices: &[UeventBlockDevice],
    guid: &str,
) -> MbResult<Option<usize>> {
    let class_block = root.join("sys/class/block");
    let dev_block = root.join("dev/block");
    let mut tables: HashMap<String, Option<PartitionTable>> = HashMap::new();

    for (index, device) in devices.iter().enumerate() {
        if device.kind == BlockKind::Disk {
            continue;
        }
        let Some(partn) = device.partn else {
            continue;
        };

        let Some(disk) = parent_disk(&class_block, &device.devname) else {
            tracing::debug!(device = %device.devname, "No parent disk, skipping");
            continue;
        };

        if !tables.contains_key(&disk) {
            let table = match File::open(dev_block.join(&disk)) {
                Ok(mut f) => PartitionTable::read(&mut f).unwrap_or_else(|e| {
                    tracing::debug!(disk = %disk, "Unreadable partition table: {}", e);
                    None
                }),
                Err(e) => {
                    tracing::debug!(disk = %disk, "Can't open disk: {}", e);
                    None
                }
            };
            tables.insert(disk.clone(), table);
        }

        let uuid = tables
            .get(&disk)
            .and_then(|t| t.as_ref())
            .and_then(|t| t.part_uuid(partn));
        if let Some(uuid) = uuid {
            if uuid.eq_ignore_ascii_case(guid) {
                return Ok(Some(index));
            }
        }
    }

    Ok(None)
}

fn parent_disk(class_block: &Path, devname: &str) -> Option<String> {
    let real = std::fs::canonicalize(class_block.join(devname)).ok()?;
    let parent = real.parent()?.file_name()?.to_str()?;
    Some(parent.to_string())
}
