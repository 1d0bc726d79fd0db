//! Entry point for the multiboot init agent.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use mbinit::block::IsolatedProbe;
use mbinit::bootdev::NetlinkUevents;
use mbinit::logging::{self, LogHandle};
use mbinit::storage::{HostOps, ToolPaths};
use mbinit::{handoff, state, watchdog, Bootstrap, InitConfig};
use mbinit_shared::errors::{MbError, MbResult};
use tracing::{error, info};

/// Multiboot init - boot volume discovery and partition replacement
///
/// Runs as the kernel's init without arguments; the flags only exist to
/// relocate paths for debugging.
#[derive(Parser, Debug)]
#[command(author, version, about = "Multiboot init agent")]
struct InitArgs {
    /// Private tree root
    #[arg(long)]
    root: Option<PathBuf>,

    /// Directory holding init.rc, file_contexts and ROM fstabs
    #[arg(long)]
    system_root: Option<PathBuf>,

    /// Kernel command line file (default: private procfs)
    #[arg(long)]
    cmdline: Option<PathBuf>,

    /// Device fstab with multiboot/UEFI tags
    #[arg(long)]
    multiboot_fstab: Option<PathBuf>,

    /// Program to exec after bootstrap
    #[arg(long)]
    init: Option<PathBuf>,

    /// Bootstrap deadline in seconds
    #[arg(long)]
    watchdog: Option<u64>,

    /// File whose presence selects recovery mode
    #[arg(long)]
    recovery_marker: Option<PathBuf>,

    #[arg(long)]
    losetup: Option<PathBuf>,

    #[arg(long)]
    mke2fs: Option<PathBuf>,

    #[arg(long)]
    dynfilefs: Option<PathBuf>,
}

impl InitArgs {
    fn into_config(self) -> InitConfig {
        let defaults = InitConfig::default();
        let tools = ToolPaths {
            losetup: self.losetup.unwrap_or(defaults.tools.losetup),
            mke2fs: self.mke2fs.unwrap_or(defaults.tools.mke2fs),
            dynfilefs: self.dynfilefs.unwrap_or(defaults.tools.dynfilefs),
        };
        InitConfig {
            root: self.root.unwrap_or(defaults.root),
            system_root: self.system_root.unwrap_or(defaults.system_root),
            cmdline: self.cmdline.or(defaults.cmdline),
            multiboot_fstab: self.multiboot_fstab.unwrap_or(defaults.multiboot_fstab),
            init: self.init.unwrap_or(defaults.init),
            watchdog: self
                .watchdog
                .map(Duration::from_secs)
                .unwrap_or(defaults.watchdog),
            recovery_marker: self.recovery_marker.unwrap_or(defaults.recovery_marker),
            fuse_node: defaults.fuse_node,
            tools,
        }
    }
}

async fn boot(config: &InitConfig, log: Option<&LogHandle>) -> MbResult<()> {
    let layout = config.layout();
    let ops = HostOps::new(config.tools.clone(), layout.proc_dir());
    let probe = IsolatedProbe::new(layout.root());

    let context = Bootstrap::new(config, &ops, &probe, log)
        .run(NetlinkUevents::open)
        .await?;

    state::save(&context, &layout.state_file())?;
    watchdog::disarm_alarm();
    match handoff::exec_init(&config.init)? {}
}

/// Log and halt the boot.
fn fatal(e: &MbError) -> ! {
    error!(kind = e.kind(), "Boot aborted: {}", e);
    std::process::abort()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] mbinit panicked: {}", panic_info);
        std::process::abort();
    }));

    let log = logging::init();
    info!("mbinit starting");

    let config = InitArgs::parse().into_config();
    watchdog::arm_alarm(config.watchdog);
    if let Err(e) = boot(&config, log.as_ref()).await {
        fatal(&e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_arguments_uses_defaults() {
        let config = InitArgs::parse_from(["mbinit"]).into_config();
        assert_eq!(config.root, PathBuf::from("/multiboot"));
        assert_eq!(config.init, PathBuf::from("/init"));
        assert_eq!(config.watchdog, Duration::from_secs(15));
        assert_eq!(
            config.cmdline_path(),
            PathBuf::from("/multiboot/proc/cmdline")
        );
    }

    #[test]
    fn test_overrides() {
        let config = InitArgs::parse_from([
            "mbinit",
            "--root",
            "/tmp/mb",
            "--watchdog",
            "30",
            "--mke2fs",
            "/sbin/mke2fs",
        ])
        .into_config();
        assert_eq!(config.root, PathBuf::from("/tmp/mb"));
        assert_eq!(config.watchdog, Duration::from_secs(30));
        assert_eq!(config.tools.mke2fs, PathBuf::from("/sbin/mke2fs"));
        assert_eq!(config.tools.losetup, PathBuf::from("losetup"));
    }
}
