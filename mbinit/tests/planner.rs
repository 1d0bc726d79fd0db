//! Integration tests for partition replacement planning.
//!
//! Runs the planner against `RecordingOps` on a temp tree:
//! - LOOP partitions attach directly to their image
//! - BIND partitions get a capped growth store with a fresh stub filesystem
//! - UEFI partitions get backups, guarded against double replacement
//! - Loop allocation stays monotonic and collision-free
//! - An expired deadline stops planning before the next partition

use std::path::{Path, PathBuf};
use std::time::Duration;

use mbinit::block::{BlockCatalog, DevKey, SysfsFeed};
use mbinit::config::{MultibootPartition, PartitionKind};
use mbinit::context::BootMode;
use mbinit::esp;
use mbinit::fstab::Fstab;
use mbinit::planner::ReplacementPlanner;
use mbinit::registry::{ReplacementOrigin, ReplacementRegistry};
use mbinit::storage::{LoopAllocator, MsFlags};
use mbinit::watchdog::Deadline;
use mbinit_shared::constants::block::{GROWTH_CAP_BLOCKS, SECTOR_SIZE};
use mbinit_shared::errors::MbError;
use mbinit_test_utils::{OpCall, RecordingOps, TestTree};

const MB_FSTAB: &str = "\
/dev/block/platform/soc/by-name/system /system ext4 ro wait,multiboot
/dev/block/platform/soc/by-name/cache  /cache  ext4 noatime wait,multiboot
/dev/block/mmcblk0p1                   /modem  emmc defaults uefi,multiboot
/dev/block/mmcblk0p2                   /sbl1   emmc defaults uefi
";

const ROM_DIR: &str = "/roms/myrom";

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct PlannerContext {
    tree: TestTree,
    ops: RecordingOps,
    catalog: BlockCatalog,
    fstab: Fstab,
}

impl PlannerContext {
    fn new() -> Self {
        let tree = TestTree::new();
        tree.sysfs()
            .add_disk("mmcblk0", 179, 0)
            .add_partition("mmcblk0p1", 179, 1, 1, Some("modem"))
            .add_partition("mmcblk0p2", 179, 2, 2, Some("sbl1"))
            .add_partition("mmcblk0p10", 179, 10, 10, Some("system"))
            .add_partition("mmcblk0p11", 179, 11, 11, Some("cache"))
            .add_partition("mmcblk0p12", 179, 12, 12, Some("persist"));
        let catalog = BlockCatalog::build(&SysfsFeed::new(tree.layout.sys_class_block())).unwrap();
        let ops = RecordingOps::new();
        ops.set_default_block_count(64 * 1024 * 1024 / SECTOR_SIZE);

        Self {
            tree,
            ops,
            catalog,
            fstab: Fstab::parse(MB_FSTAB).unwrap(),
        }
    }

    fn partition(&self, name: &str, path: &str, devname: &str) -> MultibootPartition {
        MultibootPartition {
            name: name.to_string(),
            path: PathBuf::from(path),
            kind: PartitionKind::classify(path),
            device: self.catalog.lookup_by_devname(devname).unwrap().key,
        }
    }

    fn planner(&self) -> ReplacementPlanner<'_> {
        ReplacementPlanner::new(&self.tree.layout, &self.ops, self.tree.root.join("fuse"))
    }

    fn partpath(&self, path: &str) -> PathBuf {
        self.tree
            .layout
            .on_bootdev(&Path::new(ROM_DIR).join(path))
    }

    fn backup_dir(&self) -> PathBuf {
        self.tree.layout.esp_dir().join("media/UEFIESP")
    }
}

// ============================================================================
// MULTIBOOT PARTITIONS
// ============================================================================

#[test]
fn loop_partition_attaches_directly_to_image() {
    let ctx = PlannerContext::new();
    ctx.tree.write_bootdev_file("/roms/myrom/system.img", "");
    let partitions = vec![ctx.partition("system", "system.img", "mmcblk0p10")];
    let mut registry = ReplacementRegistry::new();

    ctx.planner()
        .plan_multiboot(Path::new(ROM_DIR), &partitions, &ctx.catalog, &mut registry)
        .unwrap();

    let image = ctx.partpath("system.img");
    let loop_node = ctx.tree.layout.loop_node("system");
    assert_eq!(ctx.ops.attachments(), vec![(loop_node.clone(), image.clone())]);
    assert!(ctx.ops.growth_requests().is_empty());

    let entry = registry.by_name("system").unwrap();
    assert_eq!(entry.key, DevKey::new(179, 10));
    assert_eq!(entry.loop_device, loop_node);
    assert_eq!(entry.loop_key, DevKey::new(7, 255));
    assert_eq!(entry.loop_file.as_deref(), Some(image.as_path()));
    assert!(entry.is_attached());
    assert!(matches!(
        entry.origin,
        ReplacementOrigin::Multiboot {
            kind: PartitionKind::Loop,
            ..
        }
    ));

    // FUSE node exists before any partition is set up.
    assert!(matches!(
        ctx.ops.calls().first(),
        Some(OpCall::MakeCharNode { key, .. }) if *key == DevKey::new(10, 229)
    ));
}

#[test]
fn bind_growth_store_is_capped() {
    let ctx = PlannerContext::new();
    let layout = &ctx.tree.layout;
    let ten_gib = 10 * 1024 * 1024 * 1024 / SECTOR_SIZE;
    let hundred_mib = 100 * 1024 * 1024 / SECTOR_SIZE;
    ctx.ops.set_block_count(layout.block_node("mmcblk0p11"), ten_gib);
    ctx.ops.set_block_count(layout.block_node("mmcblk0p12"), hundred_mib);

    let partitions = vec![
        ctx.partition("cache", "cache", "mmcblk0p11"),
        ctx.partition("persist", "persist", "mmcblk0p12"),
    ];
    let mut registry = ReplacementRegistry::new();
    ctx.planner()
        .plan_multiboot(Path::new(ROM_DIR), &partitions, &ctx.catalog, &mut registry)
        .unwrap();

    assert_eq!(ctx.ops.growth_requests(), vec![GROWTH_CAP_BLOCKS, hundred_mib]);
    assert_eq!(GROWTH_CAP_BLOCKS, 409_600);
    assert!(ctx.partpath("cache").is_dir());
    assert!(ctx.partpath("persist").is_dir());
    assert_eq!(registry.len(), 2);
}

#[test]
fn bind_builds_stub_filesystem_in_order() {
    let ctx = PlannerContext::new();
    let layout = &ctx.tree.layout;
    let partitions = vec![ctx.partition("cache", "cache", "mmcblk0p11")];
    let mut registry = ReplacementRegistry::new();
    ctx.planner()
        .plan_multiboot(Path::new(ROM_DIR), &partitions, &ctx.catalog, &mut registry)
        .unwrap();

    let loop_node = layout.loop_node("cache");
    let calls: Vec<_> = ctx
        .ops
        .calls()
        .into_iter()
        .filter(|c| !matches!(c, OpCall::MakeCharNode { .. }))
        .collect();
    assert_eq!(
        calls,
        vec![
            OpCall::MountGrowthStore {
                storage: layout.growth_storage("cache"),
                mountpoint: layout.growth_mount("cache"),
                blocks: 64 * 1024 * 1024 / SECTOR_SIZE,
            },
            OpCall::MakeBlockNode {
                path: loop_node.clone(),
                key: DevKey::new(7, 255),
            },
            OpCall::AttachLoop {
                loop_device: loop_node.clone(),
                file: layout.growth_backing_file("cache"),
            },
            OpCall::MakeFilesystem {
                device: loop_node.clone(),
                fstype: "ext4".to_string(),
            },
            OpCall::Mount {
                source: loop_node,
                target: layout.stub_dir(),
                fstype: Some("ext4".to_string()),
                flags: MsFlags::empty(),
                data: None,
            },
            OpCall::CreateFile {
                path: layout.stub_idfile(),
            },
            OpCall::Unmount {
                target: layout.stub_dir(),
            },
        ]
    );

    let entry = registry.by_name("cache").unwrap();
    assert_eq!(entry.loop_file, None);
    assert!(entry.is_attached());
}

#[test]
fn bind_rejects_empty_device() {
    let ctx = PlannerContext::new();
    ctx.ops.set_block_count(ctx.tree.layout.block_node("mmcblk0p11"), 0);
    let partitions = vec![ctx.partition("cache", "cache", "mmcblk0p11")];
    let mut registry = ReplacementRegistry::new();

    let result = ctx.planner().plan_multiboot(
        Path::new(ROM_DIR),
        &partitions,
        &ctx.catalog,
        &mut registry,
    );
    assert!(matches!(result, Err(MbError::DeviceSetup(_))));
    assert!(ctx.ops.growth_requests().is_empty());
    assert!(registry.is_empty());
}

#[test]
fn existing_path_must_match_kind() {
    let ctx = PlannerContext::new();
    // A directory where a LOOP image is expected.
    std::fs::create_dir_all(ctx.partpath("system.img")).unwrap();
    let partitions = vec![ctx.partition("system", "system.img", "mmcblk0p10")];
    let mut registry = ReplacementRegistry::new();

    let result = ctx.planner().plan_multiboot(
        Path::new(ROM_DIR),
        &partitions,
        &ctx.catalog,
        &mut registry,
    );
    assert!(matches!(result, Err(MbError::DeviceSetup(_))));
    assert!(ctx.ops.attachments().is_empty());
}

// ============================================================================
// UEFI PARTITIONS
// ============================================================================

#[test]
fn uefi_partition_replaced_by_config_gets_no_backup() {
    let ctx = PlannerContext::new();
    ctx.tree.write_bootdev_file("/roms/myrom/modem.img", "");
    let partitions = vec![ctx.partition("modem", "modem.img", "mmcblk0p1")];
    let mut registry = ReplacementRegistry::new();
    let mut planner = ctx.planner();

    planner
        .plan_multiboot(Path::new(ROM_DIR), &partitions, &ctx.catalog, &mut registry)
        .unwrap();
    let mode = BootMode {
        recovery: false,
        multiboot: true,
    };
    planner
        .plan_uefi(&ctx.backup_dir(), &ctx.fstab, &ctx.catalog, mode, &mut registry)
        .unwrap();

    assert_eq!(registry.len(), 2);
    assert!(matches!(
        registry.by_name("modem").unwrap().origin,
        ReplacementOrigin::Multiboot { .. }
    ));

    let backups: Vec<_> = ctx
        .ops
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            OpCall::CopyBlocks { image, .. } => Some(image),
            _ => None,
        })
        .collect();
    assert_eq!(backups, vec![esp::backup_image(&ctx.backup_dir(), "sbl1")]);
}

#[test]
fn uefi_loop_deferred_in_platform_boot() {
    let ctx = PlannerContext::new();
    let mut registry = ReplacementRegistry::new();
    let mode = BootMode {
        recovery: false,
        multiboot: true,
    };

    ctx.planner()
        .plan_uefi(&ctx.backup_dir(), &ctx.fstab, &ctx.catalog, mode, &mut registry)
        .unwrap();

    assert!(ctx.ops.attachments().is_empty());
    let sbl1 = registry.by_name("sbl1").unwrap();
    assert!(!sbl1.is_attached());
    assert_eq!(sbl1.sync_target, None);
    assert_eq!(
        sbl1.loop_file.as_deref(),
        Some(esp::backup_image(&ctx.backup_dir(), "sbl1").as_path())
    );
}

#[test]
fn native_recovery_uses_private_copy_with_sync_target() {
    let ctx = PlannerContext::new();
    let layout = &ctx.tree.layout;
    let mut registry = ReplacementRegistry::new();
    let mode = BootMode {
        recovery: true,
        multiboot: false,
    };

    ctx.planner()
        .plan_uefi(&ctx.backup_dir(), &ctx.fstab, &ctx.catalog, mode, &mut registry)
        .unwrap();

    let modem = registry.by_name("modem").unwrap();
    let private = layout.private_loopfile("modem");
    assert_eq!(modem.loop_file.as_deref(), Some(private.as_path()));
    assert_eq!(modem.sync_target.as_deref(), Some("modem"));
    assert!(modem.is_attached());
    assert!(private.exists());
    assert!(ctx
        .ops
        .attachments()
        .contains(&(layout.loop_node("modem"), private)));
}

#[test]
fn existing_backup_is_reused() {
    let ctx = PlannerContext::new();
    std::fs::create_dir_all(ctx.backup_dir()).unwrap();
    for name in ["modem", "sbl1"] {
        std::fs::write(esp::backup_image(&ctx.backup_dir(), name), b"backup").unwrap();
    }
    let mut registry = ReplacementRegistry::new();

    ctx.planner()
        .plan_uefi(
            &ctx.backup_dir(),
            &ctx.fstab,
            &ctx.catalog,
            BootMode::default(),
            &mut registry,
        )
        .unwrap();

    assert!(!ctx
        .ops
        .calls()
        .iter()
        .any(|c| matches!(c, OpCall::CopyBlocks { .. })));
    assert_eq!(registry.len(), 2);
}

// ============================================================================
// LOOP ALLOCATION
// ============================================================================

#[test]
fn loop_allocation_is_monotonic_and_distinct() {
    let tree = TestTree::new();
    let ops = RecordingOps::new();
    let mut loops = LoopAllocator::new();

    let mut minors = Vec::new();
    for i in 0..256 {
        let key = loops
            .allocate(&ops, &tree.layout.loop_node(&format!("part{}", i)))
            .unwrap();
        assert_eq!(key.major, 7);
        minors.push(key.minor);
    }

    assert!(minors.windows(2).all(|w| w[0] > w[1]));
    assert_eq!(minors.first(), Some(&255));
    assert_eq!(minors.last(), Some(&0));
    assert_eq!(loops.created(), 256);

    let overflow = loops.allocate(&ops, &tree.layout.loop_node("one-too-many"));
    assert!(matches!(overflow, Err(MbError::DeviceSetup(_))));
}

#[test]
fn loop_path_is_never_reused() {
    let tree = TestTree::new();
    let ops = RecordingOps::new();
    let mut loops = LoopAllocator::new();
    let node = tree.layout.loop_node("system");

    loops.allocate(&ops, &node).unwrap();
    assert!(loops.allocate(&ops, &node).is_err());
    assert_eq!(loops.created(), 1);
}

// ============================================================================
// DEADLINE
// ============================================================================

#[tokio::test(start_paused = true)]
async fn expired_deadline_stops_before_next_partition() {
    let ctx = PlannerContext::new();
    ctx.tree.write_bootdev_file("/roms/myrom/system.img", "");
    ctx.tree.write_bootdev_file("/roms/myrom/cache.img", "");
    let partitions = vec![
        ctx.partition("system", "system.img", "mmcblk0p10"),
        ctx.partition("cache", "cache.img", "mmcblk0p11"),
    ];
    let mut registry = ReplacementRegistry::new();

    let deadline = Deadline::after(Duration::from_secs(1));
    tokio::time::advance(Duration::from_secs(2)).await;

    let result = ctx.planner().with_deadline(deadline).plan_multiboot(
        Path::new(ROM_DIR),
        &partitions,
        &ctx.catalog,
        &mut registry,
    );

    assert!(matches!(result, Err(MbError::Timeout(_))));
    assert!(ctx.ops.attachments().is_empty());
    assert!(registry.by_name("system").is_none());
}

#[tokio::test(start_paused = true)]
async fn live_deadline_plans_all_partitions() {
    let ctx = PlannerContext::new();
    ctx.tree.write_bootdev_file("/roms/myrom/system.img", "");
    let partitions = vec![ctx.partition("system", "system.img", "mmcblk0p10")];
    let mut registry = ReplacementRegistry::new();

    let deadline = Deadline::after(Duration::from_secs(15));
    ctx.planner()
        .with_deadline(deadline)
        .plan_multiboot(Path::new(ROM_DIR), &partitions, &ctx.catalog, &mut registry)
        .unwrap();

    assert_eq!(ctx.ops.attachments().len(), 1);
}
