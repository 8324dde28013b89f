use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The instruments the acquisition host knows how to talk to.
#[derive(Debug, Display, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Six channel actuator control board.
    #[display(fmt = "actuator")]
    Actuator,

    /// Force measuring amplifier.
    #[display(fmt = "force")]
    Force,

    /// Laser displacement sensor behind the vendor library.
    #[display(fmt = "laser")]
    Laser,

    /// Optional camera. Produces no channel values and is never polled.
    #[display(fmt = "camera")]
    Camera,
}

impl DeviceKind {
    /// Number of values a healthy device answers the self-test request with.
    pub fn expected_self_test_len(&self) -> Option<usize> {
        match self {
            Self::Actuator => Some(common::actuator::TELEMETRY_VALUE_COUNT),
            Self::Force => Some(1),
            Self::Laser => None,
            Self::Camera => None,
        }
    }

    /// Whether the scheduler sends this device read requests every tick.
    pub fn is_polled(&self) -> bool {
        matches!(self, Self::Force | Self::Laser)
    }
}

/// Tags a request so that its answer can be correlated with its origin.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestId {
    /// One-shot check run when a worker starts.
    #[display(fmt = "self-test({})", _0)]
    SelfTest(DeviceKind),

    /// Steady state polling.
    #[display(fmt = "from({})", _0)]
    FromDevice(DeviceKind),
}

impl RequestId {
    pub fn is_self_test(&self) -> bool {
        matches!(self, Self::SelfTest(_))
    }
}
