//! Transfer control to the platform init.

use std::convert::Infallible;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use mbinit_shared::errors::{MbError, MbResult};
use nix::unistd::execv;

/// Replace this process with `init`. Only returns on failure.
pub fn exec_init(init: &Path) -> MbResult<Infallible> {
    let program = CString::new(init.as_os_str().as_bytes())
        .map_err(|e| MbError::Internal(format!("Invalid init path {}: {}", init.display(), e)))?;

    tracing::info!("Starting {}", init.display());
    execv(&program, &[&program])
        .map_err(|e| MbError::Internal(format!("Can't start {}: {}", init.display(), e)))
}
