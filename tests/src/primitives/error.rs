//! MpError Tests

#[cfg(test)]
mod tests {
    use crate::error::MpError;

    #[test]
    fn test_error_strings() {
        assert_eq!(MpError::DeviceError.as_str(), "caller is not the BSP");
        assert_eq!(MpError::Timeout.as_str(), "operation timed out");
        assert_eq!(MpError::Unsupported.as_str(), "unsupported topology");
    }

    #[test]
    fn test_display_matches_as_str() {
        for error in [
            MpError::DeviceError,
            MpError::InvalidParameter,
            MpError::NotReady,
            MpError::NotStarted,
            MpError::NotFound,
            MpError::Timeout,
            MpError::Unsupported,
        ] {
            assert_eq!(format!("{}", error), error.as_str());
        }
    }
}
