use core::fmt;

/// Errors surfaced by the MP coordination layer.
///
/// The variants map one-to-one onto the conditions the dispatch and
/// bring-up operations can hit; every fallible call in the crate returns
/// `Result<_, MpError>`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MpError {
    /// The caller is not the bootstrap processor.
    DeviceError,
    /// A target index or argument is out of range or otherwise unusable.
    InvalidParameter,
    /// A targeted core is disabled or not in the Idle state.
    NotReady,
    /// No startable application processor exists.
    NotStarted,
    /// No core matches the requested identity.
    NotFound,
    /// A dispatch or rendezvous window expired.
    Timeout,
    /// The topology cannot be driven by this layer (too many cores, or a
    /// legacy APIC ID collision).
    Unsupported,
}

impl MpError {
    pub const fn as_str(self) -> &'static str {
        match self {
            MpError::DeviceError => "caller is not the BSP",
            MpError::InvalidParameter => "invalid parameter",
            MpError::NotReady => "target core not ready",
            MpError::NotStarted => "no startable core",
            MpError::NotFound => "no matching core",
            MpError::Timeout => "operation timed out",
            MpError::Unsupported => "unsupported topology",
        }
    }
}

impl fmt::Display for MpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
