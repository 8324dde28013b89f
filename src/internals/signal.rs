use std::{f64::consts::PI, fmt::Display, time::Instant};

use clap::ValueEnum;
use common::physical::{PowerVector, CHANNEL_COUNT};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Where the commanded power vector comes from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SignalMode {
    /// Live sine wave per channel.
    #[default]
    Sine,

    /// Explicitly set vector, e.g. from a script.
    Direct,
}

impl Display for SignalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sine => write!(f, "sine"),
            Self::Direct => write!(f, "direct"),
        }
    }
}

/// Sine wave of one actuator channel. Phase is in radians.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Default)]
#[serde(default)]
pub struct SineParameters {
    pub amplitude: f64,
    pub frequency: f64,
    pub phase: f64,
    pub offset: f64,
    pub enabled: bool,
}

impl SineParameters {
    /// `round(|amplitude * sin(2 pi f t + phase) + offset|)`, or 0 while the
    /// channel is disabled.
    pub fn evaluate(&self, t: f64) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        (self.amplitude * (2.0 * PI * self.frequency * t + self.phase).sin() + self.offset)
            .abs()
            .round()
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    #[error("Channel index {0} is outside 0..6.")]
    ChannelOutOfRange(usize),
}

/// Produces the 6-channel power vector the actuator board is driven with.
pub struct SignalGenerator {
    mode: SignalMode,
    sine: [SineParameters; CHANNEL_COUNT],
    direct: PowerVector,
    last: PowerVector,
    epoch: Instant,
}

impl Default for SignalGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalGenerator {
    pub fn new() -> Self {
        Self {
            mode: SignalMode::default(),
            sine: [SineParameters::default(); CHANNEL_COUNT],
            direct: PowerVector::zero(),
            last: PowerVector::zero(),
            epoch: Instant::now(),
        }
    }

    /// Start from configured sine parameters. Extra entries are ignored,
    /// missing ones stay disabled.
    pub fn with_sine(parameters: &[SineParameters]) -> Self {
        let mut generator = Self::new();
        for (slot, parameters) in generator.sine.iter_mut().zip(parameters) {
            *slot = *parameters;
        }
        generator
    }

    pub fn mode(&self) -> SignalMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SignalMode) {
        if self.mode != mode {
            debug!("Signal mode {} -> {}.", self.mode, mode);
        }
        self.mode = mode;
    }

    pub fn set_sine(&mut self, channel: usize, parameters: SineParameters) -> Result<(), SignalError> {
        let slot = self
            .sine
            .get_mut(channel)
            .ok_or(SignalError::ChannelOutOfRange(channel))?;
        *slot = parameters;
        Ok(())
    }

    pub fn sine(&self, channel: usize) -> Option<SineParameters> {
        self.sine.get(channel).copied()
    }

    pub fn set_direct(&mut self, power: PowerVector) {
        self.direct = power;
    }

    /// The vector most recently handed out by `next_vector`.
    pub fn last(&self) -> PowerVector {
        self.last
    }

    /// Vector for the current tick.
    pub fn next_vector(&mut self) -> PowerVector {
        let t = self.epoch.elapsed().as_secs_f64();
        self.last = self.vector_at(t);
        self.last
    }

    /// Vector the current mode yields `t` seconds after the generator was
    /// created.
    pub fn vector_at(&self, t: f64) -> PowerVector {
        match self.mode {
            SignalMode::Direct => self.direct,
            SignalMode::Sine => {
                let mut levels = [0i64; CHANNEL_COUNT];
                for (level, parameters) in levels.iter_mut().zip(&self.sine) {
                    *level = parameters.evaluate(t) as i64;
                }
                PowerVector::from_clamped(levels)
            }
        }
    }
}
