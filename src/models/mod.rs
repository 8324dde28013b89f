pub mod channel;
pub mod device;
pub mod row;
pub mod worker_event;
