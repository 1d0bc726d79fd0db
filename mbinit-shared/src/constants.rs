//! Shared constants between the init agent and later boot stages.
//!
//! Later stages read the handoff state and walk the same private tree, so these
//! must agree on both sides.

/// Kernel command line keys.
pub mod cmdline {
    /// Boot selector: `<GPT|MBR>,<identifier>,<path>`
    pub const MULTIBOOT_PATH: &str = "multibootpath";

    /// Log verbosity override (0=error .. 4=trace)
    pub const DEBUG: &str = "multiboot.debug";

    /// Hardware name, selects `/fstab.<hardware>`
    pub const HARDWARE: &str = "androidboot.hardware";

    /// A/B slot suffix
    pub const SLOT_SUFFIX: &str = "androidboot.slot_suffix";
}

/// Partition-table identifier lengths accepted in the boot selector.
pub mod selector {
    /// GPT unique partition GUID, textual form
    pub const GPT_ID_LEN: usize = 36;

    /// MBR disk signature plus partition number (`xxxxxxxx-yy`)
    pub const MBR_ID_LEN: usize = 11;
}

/// Block device constants
pub mod block {
    /// Sector size used by BLKGETSIZE and the backup copy
    pub const SECTOR_SIZE: u64 = 512;

    /// Loop device major number
    pub const LOOP_MAJOR: u32 = 7;

    /// Highest loop minor; allocation walks downward from here
    pub const LOOP_MINOR_MAX: u32 = 255;

    /// Number of loop nodes one run may create
    pub const LOOP_CAPACITY: u32 = LOOP_MINOR_MAX + 1;

    /// FUSE control device (needed by the growth-store helper)
    pub const FUSE_MAJOR: u32 = 10;
    pub const FUSE_MINOR: u32 = 229;

    /// Growth stores never request more than 200 MiB worth of sectors;
    /// mkfs time grows with filesystem size.
    pub const GROWTH_CAP_BLOCKS: u64 = (200 * 1024 * 1024) / SECTOR_SIZE;
}

/// Filesystem names
pub mod fs {
    /// Filesystem created inside growth stores
    pub const DEFAULT_STUB_FS: &str = "ext4";

    /// fstab type of partitions without a filesystem
    pub const RAW: &str = "emmc";

    /// Filesystems of the boot volume that can host bind-backed partitions
    pub const BIND_ALLOW_LIST: &[&str] = &["ext2", "ext3", "ext4", "f2fs"];
}

/// Configuration file section holding the partition mapping
pub const PARTITIONS_SECTION: &str = "partitions";

/// Name of ESP value that redirects backups into the data partition's media dir
pub const ESP_DATAMEDIA: &str = "datamedia";
