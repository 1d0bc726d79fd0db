//! Tracing setup.
//!
//! Logs go to stderr (the kernel console this early in boot). `RUST_LOG`
//! sets the initial filter; `multiboot.debug=<n>` on the command line
//! replaces it once the command line has been read.

use mbinit_shared::errors::{MbError, MbResult};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "info";

/// Filter directive for a `multiboot.debug` level.
pub fn level_directive(level: u8) -> &'static str {
    match level {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

/// Handle to change the log filter after initialization.
pub struct LogHandle(reload::Handle<EnvFilter, Registry>);

impl LogHandle {
    pub fn set_debug_level(&self, level: u8) -> MbResult<()> {
        let directive = level_directive(level);
        self.0
            .reload(EnvFilter::new(directive))
            .map_err(|e| MbError::Internal(format!("Failed to change log level: {}", e)))?;
        tracing::info!("Log level set to {}", directive);
        Ok(())
    }
}

/// Install the global subscriber.
///
/// Returns `None` if a subscriber is already installed; logging failure
/// must not stop the boot.
pub fn init() -> Option<LogHandle> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let (filter, handle) = reload::Layer::new(filter);

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true) // Show module names
                .with_writer(std::io::stderr),
        )
        .try_init();

    match result {
        Ok(()) => Some(LogHandle(handle)),
        Err(e) => {
            eprintln!("[ERROR] Failed to initialize tracing: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_directive() {
        assert_eq!(level_directive(0), "error");
        assert_eq!(level_directive(2), "info");
        assert_eq!(level_directive(3), "debug");
        assert_eq!(level_directive(9), "trace");
    }
}
