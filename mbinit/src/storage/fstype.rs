//! Superblock-based filesystem detection.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use mbinit_shared::errors::{MbError, MbResult};

/// Bytes needed to recognise every supported filesystem.
pub const PROBE_LEN: usize = 4096;

const EXT_MAGIC_OFFSET: usize = 0x438;
const EXT_MAGIC: u16 = 0xEF53;
const EXT_FEATURE_COMPAT: usize = 0x45C;
const EXT_FEATURE_INCOMPAT: usize = 0x460;
const EXT_FEATURE_RO_COMPAT: usize = 0x464;
const EXT3_COMPAT_HAS_JOURNAL: u32 = 0x4;
// extents | 64bit | flex_bg
const EXT4_INCOMPAT_MASK: u32 = 0x40 | 0x80 | 0x200;
// huge_file | gdt_csum | dir_nlink | extra_isize
const EXT4_RO_COMPAT_MASK: u32 = 0x8 | 0x10 | 0x20 | 0x40;

const F2FS_MAGIC_OFFSET: usize = 0x400;
const F2FS_MAGIC: u32 = 0xF2F5_2010;

/// Identify a filesystem from the start of a device or image.
pub fn probe_bytes(buf: &[u8]) -> Option<&'static str> {
    if buf.len() >= EXT_FEATURE_RO_COMPAT + 4 && read_u16(buf, EXT_MAGIC_OFFSET) == EXT_MAGIC {
        let compat = read_u32(buf, EXT_FEATURE_COMPAT);
        let incompat = read_u32(buf, EXT_FEATURE_INCOMPAT);
        let ro_compat = read_u32(buf, EXT_FEATURE_RO_COMPAT);
        if incompat & EXT4_INCOMPAT_MASK != 0 || ro_compat & EXT4_RO_COMPAT_MASK != 0 {
            return Some("ext4");
        }
        if compat & EXT3_COMPAT_HAS_JOURNAL != 0 {
            return Some("ext3");
        }
        return Some("ext2");
    }

    if buf.len() >= F2FS_MAGIC_OFFSET + 4 && read_u32(buf, F2FS_MAGIC_OFFSET) == F2FS_MAGIC {
        return Some("f2fs");
    }

    if buf.len() >= 512 {
        if &buf[3..11] == b"EXFAT   " {
            return Some("exfat");
        }
        let boot_sig = buf[510] == 0x55 && buf[511] == 0xAA;
        if boot_sig && (buf[54..59] == *b"FAT12" || buf[54..59] == *b"FAT16" || buf[82..87] == *b"FAT32") {
            return Some("vfat");
        }
    }

    None
}

/// Detect the filesystem on `source`.
pub fn detect(source: &Path) -> MbResult<&'static str> {
    let mut buf = vec![0u8; PROBE_LEN];
    let mut file = File::open(source).map_err(|e| {
        MbError::DeviceSetup(format!("Can't open {}: {}", source.display(), e))
    })?;

    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    probe_bytes(&buf[..filled]).ok_or_else(|| {
        MbError::DeviceSetup(format!("Unknown filesystem on {}", source.display()))
    })
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}
