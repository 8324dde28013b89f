//! Wire formats shared by the acquisition host: the six channel actuator
//! board command and telemetry frames, and the force amplifier opcode table
//! and sample frames. Everything in here is pure byte translation.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod actuator;
pub mod error;
pub mod force;
pub mod physical;

pub use error::FrameError;
