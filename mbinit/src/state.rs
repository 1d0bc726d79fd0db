//! Handoff state for later boot stages.

use std::fs;
use std::path::Path;

use mbinit_shared::errors::MbResult;

use crate::context::BootContext;

/// Write the boot context to `path` as JSON.
pub fn save(context: &BootContext, path: &Path) -> MbResult<()> {
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(context)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;
    tracing::debug!(path = %path.display(), "Saved boot state");
    Ok(())
}

/// Read a boot context written by [`save`].
pub fn load(path: &Path) -> MbResult<BootContext> {
    let json = fs::read(path)?;
    Ok(serde_json::from_slice(&json)?)
}
