pub mod services;

#[cfg(test)]
pub mod fake;

pub use services::*;
