use std::{fmt::Display, str::FromStr};

use common::physical::CHANNEL_COUNT;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A named scalar time series of the acquisition table.
///
/// Indices are zero based internally and one based in names, so
/// `Channel::Resistance(0)` is `r1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Resistance(u8),
    Power(u8),
    Current(u8),
    Force,
    Laser,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelError {
    #[error("Unknown channel name '{0}'.")]
    UnknownName(String),

    #[error("Channel index {0} is outside 1..=6.")]
    IndexOutOfRange(usize),
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resistance(i) => write!(f, "r{}", i + 1),
            Self::Power(i) => write!(f, "pow{}", i + 1),
            Self::Current(i) => write!(f, "curr{}", i + 1),
            Self::Force => write!(f, "force"),
            Self::Laser => write!(f, "laser"),
        }
    }
}

impl FromStr for Channel {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "force" => return Ok(Self::Force),
            "laser" => return Ok(Self::Laser),
            _ => {}
        }

        let (constructor, digits): (fn(u8) -> Channel, &str) =
            if let Some(rest) = s.strip_prefix("curr") {
                (Self::Current, rest)
            } else if let Some(rest) = s.strip_prefix("pow") {
                (Self::Power, rest)
            } else if let Some(rest) = s.strip_prefix('r') {
                (Self::Resistance, rest)
            } else {
                return Err(ChannelError::UnknownName(s.to_string()));
            };

        let number: usize = digits
            .parse()
            .map_err(|_| ChannelError::UnknownName(s.to_string()))?;
        if number == 0 || number > CHANNEL_COUNT {
            return Err(ChannelError::IndexOutOfRange(number));
        }
        Ok(constructor((number - 1) as u8))
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Channel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse().map_err(de::Error::custom)
    }
}
