//! Bootstrap sequence.
//!
//! Builds the [`BootContext`] step by step: private tree, command line, block
//! catalog, fstabs, boot volume, ROM configuration and finally the partition
//! replacements. Every error is fatal to the caller.

use std::path::Path;

use mbinit_shared::errors::{MbError, MbResult};
use mbinit_shared::MultibootLayout;
use nix::mount::MsFlags;

use crate::block::{BlockCatalog, DeviceNodes, NodeBuilder, PartUuidProbe, SysfsFeed};
use crate::bootdev::{self, BootDeviceResolver, UeventSource};
use crate::cmdline::KernelCmdline;
use crate::config::ConfigLoader;
use crate::context::{BootContext, BootMode};
use crate::esp;
use crate::fstab::Fstab;
use crate::logging::LogHandle;
use crate::planner::ReplacementPlanner;
use crate::policy::PolicyPatcher;
use crate::registry::ReplacementRegistry;
use crate::settings::InitConfig;
use crate::storage::SystemOps;
use crate::watchdog::Deadline;

pub struct Bootstrap<'a> {
    config: &'a InitConfig,
    layout: MultibootLayout,
    ops: &'a dyn SystemOps,
    probe: &'a dyn PartUuidProbe,
    log: Option<&'a LogHandle>,
}

impl<'a> Bootstrap<'a> {
    pub fn new(
        config: &'a InitConfig,
        ops: &'a dyn SystemOps,
        probe: &'a dyn PartUuidProbe,
        log: Option<&'a LogHandle>,
    ) -> Self {
        Self {
            config,
            layout: config.layout(),
            ops,
            probe,
            log,
        }
    }

    pub fn layout(&self) -> &MultibootLayout {
        &self.layout
    }

    pub async fn run<S, F>(&self, open_events: F) -> MbResult<BootContext>
    where
        S: UeventSource,
        F: FnOnce() -> MbResult<S>,
    {
        let deadline = Deadline::after(self.config.watchdog);
        let layout = &self.layout;
        let ops = self.ops;

        self.mount_private_tree()?;

        let cmdline = KernelCmdline::read(&self.config.cmdline_path())?;
        if let (Some(level), Some(log)) = (cmdline.debug_level, self.log) {
            log.set_debug_level(level)?;
        }

        let mode = BootMode::detect(&self.config.recovery_marker, cmdline.selector.as_ref());
        tracing::info!(recovery = mode.recovery, multiboot = mode.multiboot, "Boot mode");

        // Block devices and the private /dev
        let feed = SysfsFeed::new(layout.sys_class_block());
        let nodes = DeviceNodes::new(layout.block_dir(), ops);
        let mut catalog = BlockCatalog::build(&feed)?;
        ops.mount(
            Path::new("tmpfs"),
            &layout.dev_dir(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=0755"),
        )?;
        nodes.create_nodes(catalog.devices())?;

        let hardware = cmdline.require_hardware()?.to_string();
        std::fs::create_dir_all(layout.bin_dir())?;

        // fstabs
        std::fs::copy(&self.config.multiboot_fstab, layout.fstab_file()).map_err(|e| {
            MbError::Config(format!(
                "Can't extract {}: {}",
                self.config.multiboot_fstab.display(),
                e
            ))
        })?;
        let mbfstab = Fstab::read(&layout.fstab_file())?;
        mbfstab.validate_uefi_raw()?;
        let romfstab = Fstab::resolve_rom_fstab(&self.config.system_root, &hardware);

        let esp = mbfstab
            .esp()
            .cloned()
            .ok_or_else(|| MbError::Resolution("ESP partition not found".to_string()))?;
        let esp_device = catalog
            .lookup_by_path(&esp.blk_device)
            .cloned()
            .ok_or_else(|| {
                MbError::Resolution(format!("Can't find block device for ESP {}", esp.blk_device))
            })?;

        // Boot volume and ROM configuration
        let mut bootdev = None;
        let mut bootdev_supports_bind = false;
        let mut partitions = Vec::new();
        if let Some(selector) = &cmdline.selector {
            tracing::info!(id = %selector.id, path = %selector.path.display(), "Booting from ROM");

            let resolver = BootDeviceResolver::new(&selector.id, &feed, &nodes, self.probe);
            let device = resolver.resolve(&mut catalog, open_events, &deadline).await?;
            tracing::info!(device = %device.devname, "Found boot device");

            ops.mount(
                &layout.block_node(&device.devname),
                &layout.bootdev_dir(),
                None,
                MsFlags::empty(),
                None,
            )?;
            bootdev_supports_bind = bootdev::supports_bind(ops, device.key)?;

            let loader = ConfigLoader::new(&catalog, &mbfstab, bootdev_supports_bind);
            partitions = loader.load(&layout.on_bootdev(&selector.path))?;
            bootdev = Some(device.key);
        }
        deadline.check("loading the configuration")?;

        PolicyPatcher::new(&self.config.system_root, layout).apply(mode)?;

        // Replacements
        let mut replacements = ReplacementRegistry::new();
        let mut planner =
            ReplacementPlanner::new(layout, ops, &self.config.fuse_node).with_deadline(deadline);
        if let Some(selector) = &cmdline.selector {
            planner.plan_multiboot(
                selector.config_dir(),
                &partitions,
                &catalog,
                &mut replacements,
            )?;
        }

        esp::mount(ops, layout, &catalog, &esp_device, &romfstab)?;
        let esp_dir = esp.esp.as_deref().unwrap_or_default();
        let backup_dir = esp::backup_dir(&layout.esp_dir(), esp_dir)?;
        planner.plan_uefi(&backup_dir, &mbfstab, &catalog, mode, &mut replacements)?;
        if !mode.keeps_esp_mounted() {
            ops.unmount(&layout.esp_dir())?;
        }

        deadline.check("setting up partition replacements")?;
        tracing::info!(
            replacements = replacements.len(),
            loops = planner.loops().created(),
            "Bootstrap complete"
        );

        Ok(BootContext {
            selector: cmdline.selector.clone(),
            hardware,
            slot_suffix: cmdline.slot_suffix.clone(),
            mode,
            catalog,
            mbfstab,
            romfstab,
            esp,
            esp_device: esp_device.key,
            bootdev,
            bootdev_supports_bind,
            partitions,
            replacements,
        })
    }

    /// Root tmpfs, so the real root can be read-only, plus private sysfs and procfs.
    fn mount_private_tree(&self) -> MbResult<()> {
        let layout = &self.layout;
        self.ops.mount(
            Path::new("tmpfs"),
            layout.root(),
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=0755"),
        )?;
        self.ops.mount(
            Path::new("sysfs"),
            &layout.sys_dir(),
            Some("sysfs"),
            MsFlags::empty(),
            None,
        )?;
        self.ops.mount(
            Path::new("proc"),
            &layout.proc_dir(),
            Some("proc"),
            MsFlags::empty(),
            None,
        )
    }
}
