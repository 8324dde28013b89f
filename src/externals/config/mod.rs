//! Application configuration and the store the offsets are persisted in.

mod model;
mod store;

pub use model::*;
pub use store::*;
