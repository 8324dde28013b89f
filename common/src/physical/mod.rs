mod power_vector;

pub use power_vector::*;
