pub mod acquisition;
pub mod observer;
pub mod scheduler;
pub mod script;
pub mod signal;
