use std::time::Duration;

use async_trait::async_trait;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::time::sleep;

use super::{Result, SerialError, BAUD_RATE};

const POLL_INTERVAL_MS: u64 = 5;

/// Byte transport under the Link.
///
/// The serial implementation wraps a blocking `serialport` handle; tests use
/// an in-memory duplex instead.
#[async_trait]
pub trait Transport: Send {
    /// Write the whole buffer and wait for the OS to accept it.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read available bytes into `buf`, waiting up to `timeout_ms`.
    /// Returns 0 when nothing arrived within the window.
    async fn read_chunk(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize>;
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open `path` in exclusive mode at the Grid line settings.
    pub fn open(path: &str) -> Result<Self> {
        let port = serialport::new(path, BAUD_RATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_millis(POLL_INTERVAL_MS))
            .open()
            .map_err(|e| SerialError::ConnectionFailed(format!("{}: {}", path, e)))?;

        log::info!("Opened {} at {} baud", path, BAUD_RATE);
        Ok(Self { port })
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all(data)
            .map_err(|e| SerialError::WriteFailed(e.to_string()))?;
        self.port
            .flush()
            .map_err(|e| SerialError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn read_chunk(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            match self.port.bytes_to_read() {
                Ok(0) => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(0);
                    }
                    sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
                }
                Ok(_) => {
                    return match self.port.read(buf) {
                        Ok(n) => Ok(n),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
                        Err(e) => Err(SerialError::IoError(e)),
                    };
                }
                Err(e) => return Err(SerialError::SerialportError(e)),
            }
        }
    }
}
