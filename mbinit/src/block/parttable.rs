//! Partition table reader.
//!
//! Derives the partition UUIDs the boot selector refers to:
//! GPT unique partition GUIDs and MBR `<disk signature>-<partition number>`.

use std::io::{Read, Seek, SeekFrom};

use mbinit_shared::constants::block::SECTOR_SIZE;
use mbinit_shared::errors::{MbError, MbResult};

const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
const GPT_HEADER_LEN: usize = 92;
const GPT_MAX_ENTRIES: u32 = 1024;
const GPT_MIN_ENTRY_SIZE: u32 = 128;
const GPT_MAX_ENTRY_SIZE: u32 = 4096;

/// Logical sector sizes probed for the GPT header at LBA 1.
const LOGICAL_SECTOR_SIZES: [u64; 2] = [SECTOR_SIZE, 4096];

const MBR_SIGNATURE_OFFSET: usize = 440;
const MBR_BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const MBR_FIRST_ENTRY: usize = 446;
const MBR_PROTECTIVE_TYPE: u8 = 0xEE;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PartitionTable {
    /// Unique GUID per entry; `None` for unused slots.
    Gpt { entries: Vec<Option<String>> },
    Mbr { signature: u32 },
}

impl PartitionTable {
    /// Read the partition table of a whole disk.
    ///
    /// Returns `Ok(None)` when the disk carries neither table.
    pub fn read<R: Read + Seek>(disk: &mut R) -> MbResult<Option<Self>> {
        let mut mbr = [0u8; SECTOR_SIZE as usize];
        if !read_at(disk, 0, &mut mbr)? {
            return Ok(None);
        }

        let mut header = [0u8; GPT_HEADER_LEN];
        for sector_size in LOGICAL_SECTOR_SIZES {
            if read_at(disk, sector_size, &mut header)? && &header[..8] == GPT_SIGNATURE {
                return Self::read_gpt(disk, &header, sector_size).map(Some);
            }
        }

        if mbr[510..512] != MBR_BOOT_SIGNATURE {
            return Ok(None);
        }
        if mbr[MBR_FIRST_ENTRY + 4] == MBR_PROTECTIVE_TYPE {
            return Err(MbError::Resolution(
                "protective MBR without a GPT header".to_string(),
            ));
        }

        let signature = u32::from_le_bytes(le4(&mbr, MBR_SIGNATURE_OFFSET));
        Ok(Some(Self::Mbr { signature }))
    }

    fn read_gpt<R: Read + Seek>(disk: &mut R, header: &[u8], sector_size: u64) -> MbResult<Self> {
        let entry_lba = u64::from_le_bytes(le8(header, 72));
        let count = u32::from_le_bytes(le4(header, 80)).min(GPT_MAX_ENTRIES);
        let entry_size = u32::from_le_bytes(le4(header, 84));
        if !(GPT_MIN_ENTRY_SIZE..=GPT_MAX_ENTRY_SIZE).contains(&entry_size) || entry_size % 8 != 0 {
            return Err(MbError::Resolution(format!(
                "invalid GPT entry size {}",
                entry_size
            )));
        }

        // Bounded by GPT_MAX_ENTRIES * GPT_MAX_ENTRY_SIZE
        let len = count as usize * entry_size as usize;
        let offset = entry_lba.checked_mul(sector_size).ok_or_else(|| {
            MbError::Resolution(format!("GPT entry array LBA {} out of range", entry_lba))
        })?;

        let mut raw = vec![0u8; len];
        if !read_at(disk, offset, &mut raw)? {
            return Err(MbError::Resolution(
                "truncated GPT partition entry array".to_string(),
            ));
        }

        let entries = raw
            .chunks_exact(entry_size as usize)
            .map(|entry| {
                if entry[..16].iter().all(|b| *b == 0) {
                    None
                } else {
                    Some(format_guid(&entry[16..32]))
                }
            })
            .collect();

        Ok(Self::Gpt { entries })
    }

    /// PARTUUID of partition number `partn` (1-based).
    pub fn part_uuid(&self, partn: u32) -> Option<String> {
        if partn == 0 {
            return None;
        }
        match self {
            Self::Gpt { entries } => entries.get(partn as usize - 1).cloned().flatten(),
            Self::Mbr { signature } => Some(format!("{:08x}-{:02x}", signature, partn)),
        }
    }
}

/// Mixed-endian textual GUID, lowercase.
pub fn format_guid(b: &[u8]) -> String {
    format!(
        "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
        b[3], b[2], b[1], b[0], b[5], b[4], b[7], b[6],
        b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15]
    )
}

fn le4(buf: &[u8], at: usize) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[at..at + 4]);
    out
}

fn le8(buf: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[at..at + 8]);
    out
}

/// Fill `buf` from `offset`. Returns false on a short read.
fn read_at<R: Read + Seek>(disk: &mut R, offset: u64, buf: &mut [u8]) -> MbResult<bool> {
    disk.seek(SeekFrom::Start(offset))?;
    match disk.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}
