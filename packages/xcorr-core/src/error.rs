// Error taxonomy shared by the device boundary, the reduction steps and the pipeline

use thiserror::Error;

/// Result type for correlator operations
pub type XcResult<T> = Result<T, XcError>;

/// Errors that can occur while driving the correlator
#[derive(Debug, Error)]
pub enum XcError {
    /// Open/connect failure or the device vanished mid-session
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Malformed or short frame; recovered locally by skipping samples
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Rejected configuration; the previous configuration stays active
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Inverse transform failed for a single channel
    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl XcError {
    /// Whether the capture loop may continue after this error
    pub fn is_recoverable(&self) -> bool {
        matches!(self, XcError::Protocol(_) | XcError::Transform(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_errors() {
        assert!(XcError::Protocol("short frame".into()).is_recoverable());
        assert!(XcError::Transform("nan".into()).is_recoverable());
        assert!(!XcError::DeviceUnavailable("gone".into()).is_recoverable());
        assert!(!XcError::Configuration("bad".into()).is_recoverable());
        assert!(!XcError::NotConnected.is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = XcError::Configuration("time scale 64 exceeds 63".into());
        assert_eq!(err.to_string(), "Invalid configuration: time scale 64 exceeds 63");
    }
}
