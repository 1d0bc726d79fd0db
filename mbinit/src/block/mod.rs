//! Block device discovery.
//!
//! - `catalog`: the append-only list of block devices and identity lookups
//! - `nodes`: private `/dev/block` node creation
//! - `parttable`: GPT/MBR partition UUID reader
//! - `probe`: namespace-isolated partition UUID probe

pub mod catalog;
pub mod nodes;
pub mod parttable;
pub mod probe;

pub use catalog::{
    BlockCatalog, BlockFeed, BlockKind, DevKey, SysfsFeed, UeventBlockDevice, UeventRecord,
};
pub use nodes::{DeviceNodes, NodeBuilder};
pub use probe::{IsolatedProbe, PartUuidProbe};
