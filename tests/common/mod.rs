//! Shared test harness: an in-memory duplex transport and a scripted
//! device that answers decoded host requests.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use gridctl::protocol::{
    self, DecodedMessage, Instruction, TextCodec, Value,
};
use gridctl::serial::{Framer, SerialError, Transport};

/// Host-side transport half backed by channels instead of a serial port.
pub struct LoopbackTransport {
    from_device: mpsc::UnboundedReceiver<Vec<u8>>,
    to_device: mpsc::UnboundedSender<Vec<u8>>,
    pending: Vec<u8>,
}

/// Device-side half: raw bytes the host wrote, and a sender to inject
/// traffic toward the host.
pub struct DeviceEnd {
    pub from_host: mpsc::UnboundedReceiver<Vec<u8>>,
    pub to_host: mpsc::UnboundedSender<Vec<u8>>,
}

pub fn loopback() -> (LoopbackTransport, DeviceEnd) {
    let (to_host, from_device) = mpsc::unbounded_channel();
    let (to_device, from_host) = mpsc::unbounded_channel();
    (
        LoopbackTransport {
            from_device,
            to_device,
            pending: Vec::new(),
        },
        DeviceEnd { from_host, to_host },
    )
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), SerialError> {
        self.to_device
            .send(data.to_vec())
            .map_err(|_| SerialError::WriteFailed("device end dropped".to_string()))
    }

    async fn read_chunk(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, SerialError> {
        if self.pending.is_empty() {
            // honor the window like the real port: the reader must release
            // the transport lock regularly or writes would starve
            let window = std::time::Duration::from_millis(timeout_ms);
            match tokio::time::timeout(window, self.from_device.recv()).await {
                Ok(Some(bytes)) => self.pending = bytes,
                Ok(None) | Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

/// Install the reference codec for the test process.
pub fn init_codec() {
    protocol::init_protocol(Arc::new(TextCodec));
}

/// A complete inbound line for the host: sealed frame plus newline.
pub fn reply_frame(
    sx: i8,
    sy: i8,
    class: &str,
    instruction: Instruction,
    parameters: &[(String, Value)],
) -> Vec<u8> {
    let mut bytes = TextCodec::encode_reply(sx, sy, class, instruction, parameters);
    bytes.push(b'\n');
    bytes
}

/// Heartbeat with string-valued parameters, the way devices emit them.
pub fn heartbeat_frame(sx: &str, sy: &str, hwcfg: &str, fw: (&str, &str, &str)) -> Vec<u8> {
    let params = vec![
        ("HWCFG".to_string(), Value::Str(hwcfg.to_string())),
        ("VMAJOR".to_string(), Value::Str(fw.0.to_string())),
        ("VMINOR".to_string(), Value::Str(fw.1.to_string())),
        ("VPATCH".to_string(), Value::Str(fw.2.to_string())),
    ];
    let body = format!("BRC SX={} SY={}", sx, sy);
    let mut segment = String::new();
    segment.push_str(&body);
    segment.push('|');
    segment.push_str("HEARTBEAT REPORT");
    for (key, value) in &params {
        if let Value::Str(s) = value {
            segment.push_str(&format!(" {}=\"{}\"", key, s));
        }
    }
    let mut bytes = TextCodec::seal_frame(segment.as_bytes());
    bytes.push(b'\n');
    bytes
}

/// Run a scripted device: every decoded host message goes through
/// `handler`; returned frames are injected back toward the host.
pub fn spawn_device<F>(mut end: DeviceEnd, mut handler: F) -> tokio::task::JoinHandle<()>
where
    F: FnMut(DecodedMessage) -> Vec<Vec<u8>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut framer = Framer::new();
        while let Some(bytes) = end.from_host.recv().await {
            framer.push(&bytes);
            while let Ok(Some(payload)) = framer.next_payload() {
                let messages = match TextCodec.decode_packet_frame(&payload) {
                    Ok(messages) => messages,
                    Err(_) => continue,
                };
                for msg in messages {
                    for frame in handler(msg.clone()) {
                        if end.to_host.send(frame).is_err() {
                            return;
                        }
                    }
                }
            }
        }
    })
}

/// Config report answering a fetch, with the request triple echoed back as
/// strings and the action string wrapped in `<?lua ?>`.
pub fn config_report(msg: &DecodedMessage, actions: &str) -> Vec<u8> {
    let sx = msg.brc_int("DX").unwrap() as i8;
    let sy = msg.brc_int("DY").unwrap() as i8;
    let params = vec![
        (
            "PAGENUMBER".to_string(),
            Value::Str(msg.param_int("PAGENUMBER").unwrap().to_string()),
        ),
        (
            "ELEMENTNUMBER".to_string(),
            Value::Str(msg.param_int("ELEMENTNUMBER").unwrap().to_string()),
        ),
        (
            "EVENTTYPE".to_string(),
            Value::Str(msg.param_int("EVENTTYPE").unwrap().to_string()),
        ),
        (
            "ACTIONSTRING".to_string(),
            Value::Str(format!("<?lua {} ?>", actions)),
        ),
    ];
    reply_frame(sx, sy, "CONFIG", Instruction::Report, &params)
}

/// Acknowledgement for a module-addressed request.
pub fn ack_frame(msg: &DecodedMessage, class: &str) -> Vec<u8> {
    let sx = msg.brc_int("DX").unwrap() as i8;
    let sy = msg.brc_int("DY").unwrap() as i8;
    reply_frame(sx, sy, class, Instruction::Acknowledge, &[])
}

/// `TextCodec` needs the crate's `PacketCodec` trait in scope at call
/// sites; re-export it for the test files.
pub use gridctl::protocol::PacketCodec;
