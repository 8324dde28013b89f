use core::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

/// Number of actuator channels driven by the board.
pub const CHANNEL_COUNT: usize = 6;

/// One commanded level per actuator channel.
///
/// Levels are limited to what the command frame can carry (unsigned 16 bit).
/// Use `from_clamped` when converting from computed values so that negative
/// excursions floor to zero instead of wrapping.
///
/// ```
/// use common::physical::PowerVector;
/// let power = PowerVector::from_clamped([-4, 0, 12, 70_000, 5, 6]);
/// assert_eq!(power.values(), [0, 0, 12, 65535, 5, 6]);
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct PowerVector {
    values: [u16; CHANNEL_COUNT],
}

/// Represents errors in creating a `PowerVector` from loosely typed input.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PowerVectorError {
    /// Exactly `CHANNEL_COUNT` levels are required.
    #[error("Expected 6 channel levels but got {0}.")]
    WrongChannelCount(usize),

    /// A level didn't fit into the unsigned 16 bit wire representation.
    #[error("Level {value} of channel {channel} is outside 0..=65535.")]
    OutOfRange { channel: usize, value: i64 },
}

impl PowerVector {
    pub const fn new(values: [u16; CHANNEL_COUNT]) -> Self {
        Self { values }
    }

    /// All channels off.
    pub const fn zero() -> Self {
        Self {
            values: [0; CHANNEL_COUNT],
        }
    }

    /// Clamp every level into `0..=u16::MAX`.
    pub fn from_clamped(levels: [i64; CHANNEL_COUNT]) -> Self {
        let mut values = [0u16; CHANNEL_COUNT];
        for (slot, level) in values.iter_mut().zip(levels) {
            *slot = level.clamp(0, u16::MAX as i64) as u16;
        }
        Self { values }
    }

    /// Strict conversion used for explicitly set vectors (e.g. scripts),
    /// where an out of range level is a user error rather than a transient.
    pub fn try_from_levels(levels: &[i64]) -> Result<Self, PowerVectorError> {
        if levels.len() != CHANNEL_COUNT {
            return Err(PowerVectorError::WrongChannelCount(levels.len()));
        }
        let mut values = [0u16; CHANNEL_COUNT];
        for (channel, (slot, level)) in values.iter_mut().zip(levels).enumerate() {
            *slot = u16::try_from(*level).map_err(|_| PowerVectorError::OutOfRange {
                channel,
                value: *level,
            })?;
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> [u16; CHANNEL_COUNT] {
        self.values
    }

    pub fn get(&self, channel: usize) -> Option<u16> {
        self.values.get(channel).copied()
    }

    pub fn is_zero(&self) -> bool {
        self.values.iter().all(|v| *v == 0)
    }
}

impl From<[u16; CHANNEL_COUNT]> for PowerVector {
    fn from(values: [u16; CHANNEL_COUNT]) -> Self {
        Self::new(values)
    }
}

impl Display for PowerVector {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let [a, b, c, d, e, g] = self.values;
        write!(f, "<Power: [{}, {}, {}, {}, {}, {}]>", a, b, c, d, e, g)
    }
}
