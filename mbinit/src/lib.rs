//! mbinit - multiboot early-userspace init.
//!
//! Runs as the first userspace process, resolves the boot volume and the
//! selected ROM's partition mapping, replaces partitions by loop devices and
//! hands off to the platform init.

#[cfg(not(target_os = "linux"))]
compile_error!("mbinit is Linux-only; build with a Linux target");

pub mod block;
pub mod bootdev;
pub mod bootstrap;
pub mod cmdline;
pub mod config;
pub mod context;
pub mod esp;
pub mod fstab;
pub mod handoff;
pub mod logging;
pub mod planner;
pub mod policy;
pub mod registry;
pub mod settings;
pub mod state;
pub mod storage;
pub mod watchdog;

pub use bootstrap::Bootstrap;
pub use context::{BootContext, BootMode};
pub use settings::InitConfig;
