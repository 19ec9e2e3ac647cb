pub mod config;
pub mod device;
pub mod protocol;
pub mod serial;
