//! mbinit shared - Common types for the multiboot init agent
//!
//! This crate contains the error taxonomy, path constants and the private
//! filesystem layout used by the init agent and its later boot stages.

pub mod constants;
pub mod errors;
pub mod layout;

pub use errors::{MbError, MbResult};
pub use layout::MultibootLayout;
