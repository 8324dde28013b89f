pub mod externals;
pub mod internals;
pub mod models;
pub mod system;
pub mod workers;
