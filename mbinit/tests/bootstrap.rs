//! End-to-end bootstrap tests.
//!
//! Drives the whole sequence against a temp tree: command line, fake sysfs,
//! device fstab, a boot volume holding a ROM and `RecordingOps` standing in
//! for the kernel.

use mbinit::block::DevKey;
use mbinit::config::PartitionKind;
use mbinit::registry::ReplacementOrigin;
use mbinit::state;
use mbinit::{BootContext, BootMode, Bootstrap};
use mbinit_shared::constants::block::{GROWTH_CAP_BLOCKS, SECTOR_SIZE};
use mbinit_shared::errors::{MbError, MbResult};
use mbinit_test_utils::{ChannelUevents, FakeProbe, OpCall, RecordingOps, TestTree};

const GUID: &str = "8f3a9c21-5d7e-4b10-9e2a-64c1f0b7d5e3";

const MB_FSTAB: &str = "\
/dev/block/platform/soc/by-name/system   /system ext4 ro wait,multiboot
/dev/block/platform/soc/by-name/cache    /cache  ext4 noatime wait,multiboot
/dev/block/mmcblk0p1                     /modem  emmc defaults uefi
/dev/block/platform/soc/by-name/userdata /data   ext4 noatime wait,esp=datamedia
";

// ============================================================================
// TEST FIXTURES
// ============================================================================

struct BootContextFixture {
    tree: TestTree,
    ops: RecordingOps,
    probe: FakeProbe,
}

impl BootContextFixture {
    fn new(cmdline: &str) -> Self {
        let tree = TestTree::new();
        tree.sysfs()
            .add_disk("mmcblk0", 179, 0)
            .add_partition("mmcblk0p1", 179, 1, 1, Some("modem"))
            .add_partition("mmcblk0p10", 179, 10, 10, Some("system"))
            .add_partition("mmcblk0p11", 179, 11, 11, Some("cache"))
            .add_partition("mmcblk0p20", 179, 20, 20, Some("userdata"))
            .add_disk("mmcblk1", 179, 32)
            .add_partition("mmcblk1p1", 179, 33, 1, None);
        tree.write_system_file("cmdline", cmdline);
        tree.write_system_file("multiboot.fstab", MB_FSTAB);

        let ops = RecordingOps::new();
        ops.set_default_block_count(10 * 1024 * 1024 * 1024 / SECTOR_SIZE);
        ops.set_mounted(DevKey::new(179, 33), "ext4");

        Self {
            tree,
            ops,
            probe: FakeProbe::new().with(GUID, "mmcblk1p1"),
        }
    }

    fn multiboot(ini: &str) -> Self {
        let fixture = Self::new(&format!(
            "console=ttyHSL0 androidboot.hardware=foo multibootpath=GPT,{},/roms/myrom/multiboot.ini\n",
            GUID
        ));
        fixture
            .tree
            .write_bootdev_file("/roms/myrom/multiboot.ini", ini);
        fixture.tree.write_bootdev_file("/roms/myrom/system.img", "");
        fixture
    }

    async fn run(&self) -> MbResult<BootContext> {
        let config = self.tree.config();
        Bootstrap::new(&config, &self.ops, &self.probe, None)
            .run(|| -> MbResult<ChannelUevents> {
                Err(MbError::Resolution("no uevents in tests".to_string()))
            })
            .await
    }

    fn has_call(&self, pred: impl Fn(&OpCall) -> bool) -> bool {
        self.ops.calls().iter().any(pred)
    }
}

// ============================================================================
// MULTIBOOT
// ============================================================================

#[tokio::test]
async fn multiboot_boot_sets_up_rom_partitions() {
    let fixture = BootContextFixture::multiboot("[partitions]\nsystem=system.img\ncache=cache\n");
    let layout = &fixture.tree.layout;

    let ctx = fixture.run().await.unwrap();

    assert_eq!(
        ctx.mode,
        BootMode {
            recovery: false,
            multiboot: true
        }
    );
    assert_eq!(ctx.hardware, "foo");
    assert_eq!(ctx.bootdev, Some(DevKey::new(179, 33)));
    assert!(ctx.bootdev_supports_bind);
    assert_eq!(ctx.esp_device, DevKey::new(179, 20));

    let kinds: Vec<_> = ctx
        .partitions
        .iter()
        .map(|p| (p.name.as_str(), p.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![("system", PartitionKind::Loop), ("cache", PartitionKind::Bind)]
    );

    // system: loop over the ROM image
    let image = layout.bootdev_dir().join("roms/myrom/system.img");
    assert!(fixture
        .ops
        .attachments()
        .contains(&(layout.loop_node("system"), image.clone())));
    let system = ctx.replacements.by_name("system").unwrap();
    assert_eq!(system.key, DevKey::new(179, 10));
    assert_eq!(system.loop_file.as_deref(), Some(image.as_path()));

    // cache: growth store capped, stub filesystem created
    assert_eq!(fixture.ops.growth_requests(), vec![GROWTH_CAP_BLOCKS]);
    assert!(layout.bootdev_dir().join("roms/myrom/cache").is_dir());

    // modem: UEFI backup, attach deferred to the platform
    let modem = ctx.replacements.by_name("modem").unwrap();
    assert!(matches!(modem.origin, ReplacementOrigin::Uefi { .. }));
    assert!(!modem.is_attached());
    let backup = layout
        .esp_dir()
        .join("media/UEFIESP/partition_modem.img");
    assert_eq!(modem.loop_file.as_deref(), Some(backup.as_path()));
    assert!(backup.exists());

    // Each device replaced exactly once.
    assert_eq!(ctx.replacements.len(), 3);
    let mut keys: Vec<_> = ctx.replacements.iter().map(|r| r.key).collect();
    keys.sort();
    keys.dedup();
    assert_eq!(keys.len(), 3);

    assert!(fixture.ops.unmount_targets().contains(&layout.esp_dir()));
    assert!(layout.fstab_file().exists());
    assert!(fixture.tree.root.join("fuse").exists());
}

#[tokio::test]
async fn handoff_state_round_trips() {
    let fixture = BootContextFixture::multiboot("[partitions]\nsystem=system.img\ncache=cache\n");
    let ctx = fixture.run().await.unwrap();
    let path = fixture.tree.layout.state_file();

    state::save(&ctx, &path).unwrap();
    let loaded = state::load(&path).unwrap();

    assert_eq!(loaded.mode, ctx.mode);
    assert_eq!(loaded.partitions, ctx.partitions);
    assert_eq!(loaded.catalog.len(), ctx.catalog.len());
    assert_eq!(loaded.replacements.len(), 3);
    assert_eq!(
        loaded.replacements.by_name("system").unwrap().loop_key,
        ctx.replacements.by_name("system").unwrap().loop_key
    );
}

#[tokio::test]
async fn policy_violation_aborts_before_device_setup() {
    let fixture = BootContextFixture::multiboot(
        "[partitions]\nsystem=system.img\ncache=cache\nmodem=modem\n",
    );

    let result = fixture.run().await;

    assert!(matches!(result, Err(MbError::Policy(_))));
    assert!(!fixture.has_call(|c| matches!(
        c,
        OpCall::AttachLoop { .. }
            | OpCall::MakeFilesystem { .. }
            | OpCall::MountGrowthStore { .. }
            | OpCall::CopyBlocks { .. }
    )));
}

#[tokio::test]
async fn bind_rejected_on_vfat_boot_volume() {
    let fixture = BootContextFixture::multiboot("[partitions]\nsystem=system.img\ncache=cache\n");
    fixture.ops.set_mounted(DevKey::new(179, 33), "vfat");

    let result = fixture.run().await;

    assert!(matches!(result, Err(MbError::Policy(_))));
    assert!(fixture.ops.growth_requests().is_empty());
}

#[tokio::test]
async fn missing_hardware_is_fatal() {
    let fixture = BootContextFixture::new("console=ttyHSL0\n");
    let result = fixture.run().await;
    assert!(matches!(result, Err(MbError::Config(_))));
}

// ============================================================================
// NATIVE BOOTS
// ============================================================================

#[tokio::test]
async fn native_boot_only_replaces_uefi_partitions() {
    let fixture = BootContextFixture::new("androidboot.hardware=foo\n");

    let ctx = fixture.run().await.unwrap();

    assert_eq!(ctx.mode, BootMode::default());
    assert_eq!(ctx.bootdev, None);
    assert!(ctx.partitions.is_empty());
    assert_eq!(ctx.replacements.len(), 1);
    assert!(fixture.ops.attachments().is_empty());
    assert_eq!(fixture.probe.calls(), 0);
}

#[tokio::test]
async fn native_recovery_attaches_private_copies() {
    let fixture = BootContextFixture::new("androidboot.hardware=foo\n");
    fixture.tree.write_system_file("sbin/recovery", "");
    let layout = &fixture.tree.layout;

    let ctx = fixture.run().await.unwrap();

    assert!(ctx.mode.is_native_recovery());
    let modem = ctx.replacements.by_name("modem").unwrap();
    let private = layout.private_loopfile("modem");
    assert_eq!(modem.loop_file.as_deref(), Some(private.as_path()));
    assert_eq!(modem.sync_target.as_deref(), Some("modem"));
    assert!(modem.is_attached());
    assert!(fixture.ops.unmount_targets().contains(&layout.esp_dir()));
}

#[tokio::test]
async fn multiboot_recovery_keeps_esp_mounted() {
    let fixture = BootContextFixture::multiboot("[partitions]\nsystem=system.img\ncache=cache\n");
    fixture.tree.write_system_file("sbin/recovery", "");
    let layout = &fixture.tree.layout;

    let ctx = fixture.run().await.unwrap();

    assert!(ctx.mode.keeps_esp_mounted());
    assert!(ctx.replacements.by_name("modem").unwrap().is_attached());
    assert!(!fixture.ops.unmount_targets().contains(&layout.esp_dir()));
}

// ============================================================================
// ESP MOUNT
// ============================================================================

#[tokio::test]
async fn esp_mount_retries_without_rom_flags() {
    let fixture = BootContextFixture::new("androidboot.hardware=foo\n");
    fixture.tree.write_system_file(
        "fstab.foo",
        "/dev/block/platform/soc/by-name/userdata /data ext4 noatime,nosuid wait\n",
    );
    let layout = &fixture.tree.layout;
    let rom_flags = mbinit::storage::MsFlags::MS_NOATIME | mbinit::storage::MsFlags::MS_NOSUID;
    fixture.ops.fail_mount(layout.esp_dir(), rom_flags);

    fixture.run().await.unwrap();

    let esp_mounts: Vec<_> = fixture
        .ops
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            OpCall::Mount { target, flags, .. } if target == layout.esp_dir() => Some(flags),
            _ => None,
        })
        .collect();
    assert_eq!(
        esp_mounts,
        vec![rom_flags, mbinit::storage::MsFlags::empty()]
    );
}
