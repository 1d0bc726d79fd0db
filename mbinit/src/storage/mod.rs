//! Storage primitives.
//!
//! Every mutation of the device or mount state goes through [`SystemOps`], so
//! the planner and loader can run against a recording implementation.

pub mod fstype;
pub mod host;
pub mod loop_device;
pub mod ops;

pub use host::{HostOps, ToolPaths};
pub use loop_device::LoopAllocator;
pub use nix::mount::MsFlags;
pub use ops::SystemOps;
