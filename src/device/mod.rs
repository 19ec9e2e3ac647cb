pub mod correlator;
pub mod types;

mod manager;

pub use correlator::Correlator;
pub use manager::Device;
pub use types::{ElementEntry, ElementType, EventType, FirmwareVersion, ModuleInfo};

use crate::protocol::ProtocolError;
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Serial error: {0}")]
    Serial(#[from] SerialError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No matching response within the timeout")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol unstable: {failed} of {total} event fetches failed")]
    ProtocolUnstable { failed: usize, total: usize },

    #[error("Device did not confirm the switch to page {0}")]
    PageChangeFailed(u8),

    #[error("Action string is {len} bytes, device limit is {max}")]
    ConfigTooLong { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, DeviceError>;
