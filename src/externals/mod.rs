pub mod config;
pub mod event_logging;
pub mod laser;
pub mod port_search;
pub mod transport;
