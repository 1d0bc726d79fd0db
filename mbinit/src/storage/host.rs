//! Kernel-backed [`SystemOps`].
//!
//! Mounts and device nodes go through nix; loop setup, filesystem creation and
//! growth stores are delegated to external helper tools.

use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::Command;

use mbinit_shared::constants::block::SECTOR_SIZE;
use mbinit_shared::errors::{MbError, MbResult};
use nix::mount::{mount, umount, MsFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};

use super::SystemOps;
use crate::block::DevKey;

// BLKGETSIZE: device size in 512-byte sectors
nix::ioctl_read_bad!(blk_get_size, 0x1260, nix::libc::c_ulong);

/// Locations of the external helper tools.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolPaths {
    pub losetup: PathBuf,
    pub mke2fs: PathBuf,
    pub dynfilefs: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            losetup: PathBuf::from("losetup"),
            mke2fs: PathBuf::from("mke2fs"),
            dynfilefs: PathBuf::from("dynfilefs"),
        }
    }
}

pub struct HostOps {
    tools: ToolPaths,
    proc_root: PathBuf,
}

impl HostOps {
    /// `proc_root` is where procfs is mounted (the private `{root}/proc`).
    pub fn new(tools: ToolPaths, proc_root: impl Into<PathBuf>) -> Self {
        Self {
            tools,
            proc_root: proc_root.into(),
        }
    }

    fn run_tool<I, S>(&self, tool: &Path, args: I) -> MbResult<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = Command::new(tool).args(args).output().map_err(|e| {
            MbError::DeviceSetup(format!("Failed to run {}: {}", tool.display(), e))
        })?;

        if !output.status.success() {
            return Err(MbError::DeviceSetup(format!(
                "{} failed ({}): {}",
                tool.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn make_node(&self, path: &Path, kind: SFlag, key: DevKey) -> MbResult<()> {
        mknod(
            path,
            kind,
            Mode::S_IRUSR | Mode::S_IWUSR,
            makedev(u64::from(key.major), u64::from(key.minor)),
        )
        .map_err(|e| {
            MbError::DeviceSetup(format!(
                "Failed to create node {} ({}): {}",
                path.display(),
                key,
                e
            ))
        })
    }
}

impl SystemOps for HostOps {
    fn mount(
        &self,
        source: &Path,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> MbResult<()> {
        std::fs::create_dir_all(target).map_err(|e| {
            MbError::DeviceSetup(format!(
                "Failed to create mount point {}: {}",
                target.display(),
                e
            ))
        })?;

        let fstype = match fstype {
            Some(t) => Some(t),
            None if flags.contains(MsFlags::MS_BIND) => None,
            None => Some(super::fstype::detect(source)?),
        };

        mount(Some(source), target, fstype, flags, data).map_err(|e| {
            MbError::DeviceSetup(format!(
                "Failed to mount {} to {} (type={:?}): {}",
                source.display(),
                target.display(),
                fstype,
                e
            ))
        })?;

        tracing::debug!(
            "Mounted {} → {} (type={:?}, flags={:?})",
            source.display(),
            target.display(),
            fstype,
            flags
        );
        Ok(())
    }

    fn unmount(&self, target: &Path) -> MbResult<()> {
        umount(target).map_err(|e| {
            MbError::DeviceSetup(format!("Failed to unmount {}: {}", target.display(), e))
        })?;
        tracing::debug!("Unmounted {}", target.display());
        Ok(())
    }

    fn mounted_fstype(&self, key: DevKey) -> MbResult<Option<String>> {
        let process = procfs::process::Process::new_with_root(self.proc_root.join("self"))
            .map_err(|e| MbError::Io(io::Error::other(e.to_string())))?;
        let mounts = process
            .mountinfo()
            .map_err(|e| MbError::Io(io::Error::other(e.to_string())))?;

        let majmin = key.to_string();
        Ok(mounts
            .into_iter()
            .find(|m| m.majmin == majmin)
            .map(|m| m.fs_type))
    }

    fn make_block_node(&self, path: &Path, key: DevKey) -> MbResult<()> {
        self.make_node(path, SFlag::S_IFBLK, key)
    }

    fn make_char_node(&self, path: &Path, key: DevKey) -> MbResult<()> {
        self.make_node(path, SFlag::S_IFCHR, key)
    }

    fn block_count(&self, device: &Path) -> MbResult<u64> {
        let file = File::open(device).map_err(|e| {
            MbError::DeviceSetup(format!("Can't open {}: {}", device.display(), e))
        })?;

        let mut sectors: nix::libc::c_ulong = 0;
        // SAFETY: BLKGETSIZE writes one c_ulong through the pointer.
        unsafe { blk_get_size(file.as_raw_fd(), &mut sectors) }.map_err(|e| {
            MbError::DeviceSetup(format!("Can't get size of {}: {}", device.display(), e))
        })?;

        Ok(u64::from(sectors))
    }

    fn attach_loop(&self, loop_device: &Path, file: &Path) -> MbResult<()> {
        self.run_tool(&self.tools.losetup, [loop_device.as_os_str(), file.as_os_str()])?;
        tracing::debug!("Attached {} to {}", file.display(), loop_device.display());
        Ok(())
    }

    fn make_filesystem(&self, device: &Path, fstype: &str) -> MbResult<()> {
        if !matches!(fstype, "ext2" | "ext3" | "ext4") {
            return Err(MbError::DeviceSetup(format!(
                "Can't create '{}' filesystem on {}",
                fstype,
                device.display()
            )));
        }

        tracing::info!("Formatting {} with {}", device.display(), fstype);
        self.run_tool(
            &self.tools.mke2fs,
            [
                OsStr::new("-t"),
                OsStr::new(fstype),
                OsStr::new("-m"),
                OsStr::new("0"),
                OsStr::new("-F"),
                device.as_os_str(),
            ],
        )
    }

    fn mount_growth_store(&self, storage: &Path, mountpoint: &Path, blocks: u64) -> MbResult<()> {
        if blocks == 0 {
            return Err(MbError::DeviceSetup(format!(
                "Refusing empty growth store {}",
                storage.display()
            )));
        }
        std::fs::create_dir_all(mountpoint)?;

        let blocks = blocks.to_string();
        self.run_tool(
            &self.tools.dynfilefs,
            [storage.as_os_str(), OsStr::new(&blocks), mountpoint.as_os_str()],
        )
    }

    fn copy_blocks(&self, device: &Path, image: &Path, blocks: u64) -> MbResult<()> {
        let partial = partial_path(image);
        if let Err(e) = copy_device(device, &partial, blocks) {
            let _ = std::fs::remove_file(&partial);
            return Err(e);
        }
        std::fs::rename(&partial, image).map_err(|e| {
            let _ = std::fs::remove_file(&partial);
            MbError::DeviceSetup(format!("Can't move backup to {}: {}", image.display(), e))
        })?;

        tracing::info!(
            "Copied {} → {} ({} sectors)",
            device.display(),
            image.display(),
            blocks
        );
        Ok(())
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> MbResult<()> {
        std::fs::copy(src, dst).map_err(|e| {
            MbError::DeviceSetup(format!(
                "Can't copy {} to {}: {}",
                src.display(),
                dst.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn create_file(&self, path: &Path) -> MbResult<()> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| MbError::DeviceSetup(format!("Can't create {}: {}", path.display(), e)))?;
        Ok(())
    }
}

/// `<image>.tmp`, where a backup is written before it is moved into place.
fn partial_path(image: &Path) -> PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Copy exactly `blocks` sectors of `device` into a new file at `dst`.
fn copy_device(device: &Path, dst: &Path, blocks: u64) -> MbResult<()> {
    let src = File::open(device)
        .map_err(|e| MbError::DeviceSetup(format!("Can't open {}: {}", device.display(), e)))?;
    let mut out = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .map_err(|e| MbError::DeviceSetup(format!("Can't create {}: {}", dst.display(), e)))?;

    let expected = blocks.checked_mul(SECTOR_SIZE).ok_or_else(|| {
        MbError::DeviceSetup(format!("Size of {} overflows: {} sectors", device.display(), blocks))
    })?;
    let copied = io::copy(&mut io::Read::take(src, expected), &mut out)?;
    if copied != expected {
        return Err(MbError::DeviceSetup(format!(
            "Short copy from {}: {} of {} bytes",
            device.display(),
            copied,
            expected
        )));
    }
    out.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ops() -> HostOps {
        HostOps::new(ToolPaths::default(), "/proc")
    }

    #[test]
    fn test_copy_blocks_complete() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("mmcblk0p1");
        let image = dir.path().join("partition_modem.img");
        std::fs::write(&device, vec![0x5a; 4 * SECTOR_SIZE as usize]).unwrap();

        ops().copy_blocks(&device, &image, 3).unwrap();

        assert_eq!(
            std::fs::metadata(&image).unwrap().len(),
            3 * SECTOR_SIZE
        );
        assert!(!partial_path(&image).exists());
    }

    #[test]
    fn test_short_copy_leaves_no_image() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("mmcblk0p1");
        let image = dir.path().join("partition_modem.img");
        std::fs::write(&device, vec![0x5a; 3 * SECTOR_SIZE as usize]).unwrap();

        let result = ops().copy_blocks(&device, &image, 100);

        assert!(matches!(result, Err(MbError::DeviceSetup(_))));
        assert!(!image.exists());
        assert!(!partial_path(&image).exists());
    }

    #[test]
    fn test_stale_partial_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let device = dir.path().join("mmcblk0p1");
        let image = dir.path().join("partition_modem.img");
        std::fs::write(&device, vec![0x5a; SECTOR_SIZE as usize]).unwrap();
        std::fs::write(partial_path(&image), b"leftover from an interrupted boot").unwrap();

        ops().copy_blocks(&device, &image, 1).unwrap();

        assert_eq!(std::fs::read(&image).unwrap(), vec![0x5a; SECTOR_SIZE as usize]);
    }

    #[test]
    fn test_missing_device() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("partition_modem.img");
        let result = ops().copy_blocks(&dir.path().join("absent"), &image, 1);
        assert!(result.is_err());
        assert!(!image.exists());
    }
}
