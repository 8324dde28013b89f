//! Force measuring amplifier protocol.
//!
//! Commands are one or two byte opcodes (rates use a four byte sequence).
//! While transmission is running the amplifier streams samples framed as
//! `0xA5` followed by a big endian `u16` raw value.

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::error::FrameError;

/// Start delimiter of every streamed sample.
pub const SAMPLE_DELIMITER: u8 = 0xA5;

/// Delimiter plus the two value bytes.
pub const SAMPLE_FRAME_LEN: usize = 3;

/// Raw reading for zero input, the midpoint of the bipolar range.
pub const RAW_ZERO: u16 = 0x8000;

/// Calibration profile of one load cell / amplifier pairing.
///
/// The serialized names follow the configuration file (`fn`, `sn`, `u_e`).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct ForceProfile {
    /// Nominal force of the load cell.
    #[serde(rename = "fn")]
    pub nominal_force: f64,

    /// Sensor output at nominal force.
    #[serde(rename = "sn")]
    pub nominal_output: f64,

    /// Amplifier gain.
    #[serde(rename = "u_e")]
    pub gain: f64,
}

/// Represents errors in creating or using a `ForceProfile`.
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum ForceError {
    /// Output at nominal force must be a finite, non zero number.
    #[error("Invalid output at nominal force: {0}")]
    InvalidNominalOutput(f64),

    /// Nominal force and gain must be finite.
    #[error("Calibration values must be finite.")]
    NotFinite,
}

impl Default for ForceProfile {
    fn default() -> Self {
        Self {
            nominal_force: 0.5,
            nominal_output: 0.6,
            gain: 2.0,
        }
    }
}

impl ForceProfile {
    pub fn new(nominal_force: f64, nominal_output: f64, gain: f64) -> Result<Self, ForceError> {
        let profile = Self {
            nominal_force,
            nominal_output,
            gain,
        };
        profile.validate()?;
        Ok(profile)
    }

    /// Check a profile that came in through deserialization.
    pub fn validate(&self) -> Result<(), ForceError> {
        if !self.nominal_output.is_finite() || self.nominal_output == 0.0 {
            return Err(ForceError::InvalidNominalOutput(self.nominal_output));
        }
        if !self.nominal_force.is_finite() || !self.gain.is_finite() {
            return Err(ForceError::NotFinite);
        }
        Ok(())
    }

    /// Convert a raw amplifier reading into a physical value:
    /// `(Fn / Sn) * ((A - 0x8000) / 0x8000) * u_e`.
    pub fn convert(&self, raw: u16) -> f64 {
        let normalized = (raw as f64 - RAW_ZERO as f64) / RAW_ZERO as f64;
        self.nominal_force / self.nominal_output * normalized * self.gain
    }
}

/// Decode a `[0xA5, hi, lo]` sample frame into its raw reading.
pub fn decode_sample(bytes: &[u8]) -> Result<u16, FrameError> {
    if bytes.len() != SAMPLE_FRAME_LEN {
        return Err(FrameError::WrongLength {
            expected: SAMPLE_FRAME_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0] != SAMPLE_DELIMITER {
        return Err(FrameError::MissingDelimiter(bytes[0]));
    }
    Ok(u16::from_be_bytes([bytes[1], bytes[2]]))
}

/// Encode a raw reading the way the amplifier streams it.
pub fn encode_sample(raw: u16) -> [u8; SAMPLE_FRAME_LEN] {
    let [hi, lo] = raw.to_be_bytes();
    [SAMPLE_DELIMITER, hi, lo]
}

/// Sample rates supported by the amplifier.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleRate {
    Hz50,
    Hz100,
    Hz200,
    Hz500,
    Hz800,
}

impl SampleRate {
    fn code(self) -> u8 {
        match self {
            Self::Hz50 => 0x07,
            Self::Hz100 => 0x06,
            Self::Hz200 => 0x05,
            Self::Hz500 => 0x04,
            Self::Hz800 => 0x03,
        }
    }
}

/// Output mode flags of the `SetMode` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeFlags {
    pub text: bool,
    pub max: bool,
    pub log: bool,
    pub window: bool,
}

impl ModeFlags {
    pub fn bits(&self) -> u8 {
        let mut bits = 0u8;
        if self.text {
            bits |= 0b00010;
        }
        if self.max {
            bits |= 0b00100;
        }
        if self.log {
            bits |= 0b01000;
        }
        if self.window {
            bits |= 0b10000;
        }
        bits
    }
}

/// Opcodes understood by the amplifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceCommand {
    /// Load all settings from the given parameter set.
    GetAll(u8),
    /// Store all settings into the given parameter set.
    SaveAll(u8),
    StartTransmission,
    StopTransmission,
    /// Tare the amplifier output.
    SetZero,
    SetOffset,
    SetBipolar,
    SetUnipolar,
    /// Answered with 8 bytes.
    GetSerialNumber,
    SetMode(ModeFlags),
    GetMode,
    GetSpecialMode,
    ClearMaximum,
    ClearBuffer,
    SetRate(SampleRate),
}

/// Encoded command bytes, at most four long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedCommand {
    bytes: [u8; 4],
    len: usize,
}

impl EncodedCommand {
    fn one(a: u8) -> Self {
        Self {
            bytes: [a, 0, 0, 0],
            len: 1,
        }
    }

    fn two(a: u8, b: u8) -> Self {
        Self {
            bytes: [a, b, 0, 0],
            len: 2,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl ForceCommand {
    pub fn encode(&self) -> EncodedCommand {
        match self {
            Self::GetAll(set) => EncodedCommand::two(0x09, *set),
            Self::SaveAll(set) => EncodedCommand::two(0x0A, *set),
            Self::StartTransmission => EncodedCommand::one(0x24),
            Self::StopTransmission => EncodedCommand::one(0x23),
            Self::SetZero => EncodedCommand::one(0x0C),
            Self::SetOffset => EncodedCommand::one(0x0E),
            Self::SetBipolar => EncodedCommand::one(0x14),
            Self::SetUnipolar => EncodedCommand::one(0x15),
            Self::GetSerialNumber => EncodedCommand::one(0x1F),
            Self::SetMode(flags) => EncodedCommand::two(0x26, flags.bits()),
            Self::GetMode => EncodedCommand::one(0x27),
            Self::GetSpecialMode => EncodedCommand::one(0x89),
            Self::ClearMaximum => EncodedCommand::one(0x3C),
            Self::ClearBuffer => EncodedCommand::one(0x25),
            Self::SetRate(rate) => EncodedCommand {
                bytes: [0x8A, rate.code(), 0xFC, 0xF3],
                len: 4,
            },
        }
    }

    /// Number of reply bytes the amplifier sends for query commands.
    pub fn reply_len(&self) -> usize {
        match self {
            Self::GetSerialNumber => 8,
            Self::GetMode => 1,
            Self::GetSpecialMode => 2,
            _ => 0,
        }
    }
}
