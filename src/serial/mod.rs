pub mod framer;
pub mod link;
pub mod port;

pub use framer::Framer;
pub use link::{Link, LinkEvent};
pub use port::{SerialTransport, Transport};

use serde::{Deserialize, Serialize};

/// Serial settings for the Grid chain: 2 Mbaud, 8-N-1, no flow control.
pub const BAUD_RATE: u32 = 2_000_000;

/// USB vendor/product pairs assigned to Grid controllers.
pub const GRID_USB_IDS: [(u16, u16); 4] = [
    (0x03EB, 0xECAC),
    (0x03EB, 0xECAD),
    (0x303A, 0x8123),
    (0x303A, 0x8124),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub path: String,
    pub vid: u16,
    pub pid: u16,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Framing overflow: {0} bytes buffered without a frame delimiter")]
    FramingOverflow(usize),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Communication timeout")]
    Timeout,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

pub type Result<T> = std::result::Result<T, SerialError>;

/// Enumerate connected Grid devices by USB vendor/product id.
///
/// Ports that are not USB or carry a foreign vid/pid are skipped; the
/// serial number is normalized (trimmed, uppercased) so it can be compared
/// against values recorded in pulled configurations.
pub fn enumerate_devices() -> Result<Vec<DeviceInfo>> {
    let ports = serialport::available_ports()?;
    let mut devices = Vec::new();

    for port_info in ports {
        let usb = match &port_info.port_type {
            serialport::SerialPortType::UsbPort(usb) => usb,
            _ => continue,
        };
        if !GRID_USB_IDS.contains(&(usb.vid, usb.pid)) {
            log::debug!("Port {} is not a Grid device", port_info.port_name);
            continue;
        }
        devices.push(DeviceInfo {
            path: port_info.port_name.clone(),
            vid: usb.vid,
            pid: usb.pid,
            product: usb.product.clone(),
            serial_number: usb
                .serial_number
                .as_ref()
                .map(|s| s.trim().to_uppercase()),
        });
    }

    Ok(devices)
}
