pub mod services;

#[cfg(test)]
pub mod mock;

pub use services::*;
