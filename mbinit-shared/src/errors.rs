//! Error taxonomy for the multiboot init agent.
//!
//! Every variant is fatal for the boot: the agent has no recoverable route once
//! the storage layout may be inconsistent. Variants exist so the abort message
//! says which stage gave up.

use thiserror::Error;

/// Result alias used across the agent.
pub type MbResult<T> = Result<T, MbError>;

#[derive(Debug, Error)]
pub enum MbError {
    /// Malformed configuration, command line or fstab, or a count mismatch
    /// between configuration passes.
    #[error("config: {0}")]
    Config(String),

    /// No device matched a partition name or partition-table identifier.
    #[error("resolution: {0}")]
    Resolution(String),

    /// A requested replacement is not allowed on this device.
    #[error("policy violation: {0}")]
    Policy(String),

    /// Loop, mount or filesystem creation failed.
    #[error("device setup: {0}")]
    DeviceSetup(String),

    /// The bootstrap watchdog expired.
    #[error("watchdog expired while {0}")]
    Timeout(String),

    /// Serialization of handoff state failed.
    #[error("state: {0}")]
    State(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Broken internal invariant.
    #[error("internal: {0}")]
    Internal(String),
}

impl MbError {
    /// Short category name, used as a structured log field on abort.
    pub fn kind(&self) -> &'static str {
        match self {
            MbError::Config(_) => "config",
            MbError::Resolution(_) => "resolution",
            MbError::Policy(_) => "policy",
            MbError::DeviceSetup(_) => "device_setup",
            MbError::Timeout(_) => "timeout",
            MbError::State(_) => "state",
            MbError::Io(_) => "io",
            MbError::Internal(_) => "internal",
        }
    }
}

impl From<String> for MbError {
    fn from(s: String) -> Self {
        MbError::Internal(s)
    }
}

impl From<&str> for MbError {
    fn from(s: &str) -> Self {
        MbError::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_category() {
        let err = MbError::Policy("raw device /dev/block/mmcblk0p1".to_string());
        assert_eq!(
            err.to_string(),
            "policy violation: raw device /dev/block/mmcblk0p1"
        );
        assert_eq!(err.kind(), "policy");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MbError = io.into();
        assert_eq!(err.kind(), "io");
    }
}
