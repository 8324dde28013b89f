use thiserror_no_std::Error;

/// Raised when raw bytes don't form a valid frame for a device protocol.
/// A frame error never carries partially decoded values.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// The byte count didn't match the fixed frame size of the protocol.
    #[error("Expected a frame of {expected} bytes but got {actual}.")]
    WrongLength { expected: usize, actual: usize },

    /// The command frame didn't start with the `uz` prefix.
    #[error("Frame is missing the command prefix.")]
    BadPrefix,

    /// The status byte doesn't name a known actuator mode.
    #[error("Unknown actuator mode {0}.")]
    UnknownMode(u8),

    /// A force sample must start with the `0xA5` delimiter.
    #[error("Expected sample delimiter but found {0:#04x}.")]
    MissingDelimiter(u8),
}
