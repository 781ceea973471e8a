use xcorr_core::XcError;

pub const SUCCESS: i32 = 0;
pub const EXECUTION_ERROR: i32 = 1;
pub const INPUT_ERROR: i32 = 2;
pub const DEVICE_ERROR: i32 = 3;

/// Exit code for a pipeline error
pub fn for_error(error: &XcError) -> i32 {
    match error {
        XcError::Configuration(_) => INPUT_ERROR,
        XcError::DeviceUnavailable(_) | XcError::NotConnected | XcError::Protocol(_) => {
            DEVICE_ERROR
        }
        XcError::Transform(_) | XcError::Io(_) => EXECUTION_ERROR,
    }
}
