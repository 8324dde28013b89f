//! Actuator board protocol.
//!
//! Outbound command frame (16 bytes):
//! `b"uz"`, status byte (actuator mode), reserved byte (0), then six
//! little endian `u16` channel levels.
//!
//! Inbound telemetry frame (16 bytes): eight little endian `i16` values.
//! Indices 2..=7 carry the resistance of channels 1..=6.

use core::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{
    error::FrameError,
    physical::{PowerVector, CHANNEL_COUNT},
};

/// Every command frame starts with these two ASCII bytes.
pub const COMMAND_PREFIX: [u8; 2] = *b"uz";

/// Size of an outbound command frame.
pub const COMMAND_FRAME_LEN: usize = 16;

/// Size of an inbound telemetry frame.
pub const TELEMETRY_FRAME_LEN: usize = 16;

/// Number of values carried by a telemetry frame.
pub const TELEMETRY_VALUE_COUNT: usize = 8;

/// Index of the first resistance value inside a telemetry frame.
pub const RESISTANCE_OFFSET: usize = 2;

/// Control mode selected by the status byte of a command frame.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActuatorMode {
    /// Closed loop, the commanded levels are electrical power set points.
    Power,

    /// Open loop, the commanded levels are currents.
    #[default]
    Current,
}

impl ActuatorMode {
    pub const fn status_byte(self) -> u8 {
        match self {
            Self::Power => 2,
            Self::Current => 3,
        }
    }
}

impl TryFrom<u8> for ActuatorMode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Power),
            3 => Ok(Self::Current),
            other => Err(FrameError::UnknownMode(other)),
        }
    }
}

impl Display for ActuatorMode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Power => write!(f, "power (closed loop)"),
            Self::Current => write!(f, "current (open loop)"),
        }
    }
}

/// A decoded command frame. The status byte is kept raw because the
/// self-test frame carries a zero status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame {
    pub status: u8,
    pub power: PowerVector,
}

impl CommandFrame {
    pub fn mode(&self) -> Result<ActuatorMode, FrameError> {
        ActuatorMode::try_from(self.status)
    }
}

/// Build the command frame writing `power` in the given mode.
pub fn encode_command(power: &PowerVector, mode: ActuatorMode) -> [u8; COMMAND_FRAME_LEN] {
    encode_with_status(power, mode.status_byte())
}

/// The fixed frame used to check that a board answers at all.
pub fn self_test_command() -> [u8; COMMAND_FRAME_LEN] {
    encode_with_status(&PowerVector::zero(), 0)
}

fn encode_with_status(power: &PowerVector, status: u8) -> [u8; COMMAND_FRAME_LEN] {
    let mut frame = [0u8; COMMAND_FRAME_LEN];
    frame[0..2].copy_from_slice(&COMMAND_PREFIX);
    frame[2] = status;
    // frame[3] is reserved and stays 0
    for (i, level) in power.values().iter().enumerate() {
        let start = 4 + i * 2;
        frame[start..start + 2].copy_from_slice(&level.to_le_bytes());
    }
    frame
}

/// Decode a command frame. Used by loopback tooling and tests, the board
/// itself never sends these back.
pub fn decode_command(bytes: &[u8]) -> Result<CommandFrame, FrameError> {
    if bytes.len() != COMMAND_FRAME_LEN {
        return Err(FrameError::WrongLength {
            expected: COMMAND_FRAME_LEN,
            actual: bytes.len(),
        });
    }
    if bytes[0..2] != COMMAND_PREFIX {
        return Err(FrameError::BadPrefix);
    }
    let mut levels = [0u16; CHANNEL_COUNT];
    for (i, chunk) in bytes[4..].chunks_exact(2).enumerate() {
        levels[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
    }
    Ok(CommandFrame {
        status: bytes[2],
        power: PowerVector::new(levels),
    })
}

/// Decode a telemetry frame into its eight signed values.
/// Anything other than exactly `TELEMETRY_FRAME_LEN` bytes is rejected.
pub fn decode_telemetry(bytes: &[u8]) -> Result<[i16; TELEMETRY_VALUE_COUNT], FrameError> {
    if bytes.len() != TELEMETRY_FRAME_LEN {
        return Err(FrameError::WrongLength {
            expected: TELEMETRY_FRAME_LEN,
            actual: bytes.len(),
        });
    }
    let mut values = [0i16; TELEMETRY_VALUE_COUNT];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        values[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
    }
    Ok(values)
}

/// Encode eight values the way the board reports them.
pub fn encode_telemetry(values: &[i16; TELEMETRY_VALUE_COUNT]) -> [u8; TELEMETRY_FRAME_LEN] {
    let mut frame = [0u8; TELEMETRY_FRAME_LEN];
    for (i, value) in values.iter().enumerate() {
        frame[i * 2..i * 2 + 2].copy_from_slice(&value.to_le_bytes());
    }
    frame
}
