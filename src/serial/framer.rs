use super::{Result, SerialError};

/// Hard cap on buffered bytes without a complete frame.
pub const MAX_BUFFER: usize = 1024 * 1024;

const EOT: u8 = 0x04;
const LF: u8 = 0x0A;

/// Byte-stream to message-payload transform.
///
/// A payload is the longest prefix of the buffer whose next newline is
/// preceded (three bytes back) by EOT; the two bytes in between are the
/// checksum tail owned by the packet codec. The framer never inspects the
/// checksum and never emits a partial frame.
pub struct Framer {
    buf: Vec<u8>,
    // first unscanned offset, so repeated pushes do not rescan old bytes
    scan: usize,
}

impl Framer {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            scan: 0,
        }
    }

    /// Append a chunk of raw bytes from the stream.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Extract the next complete payload, if any.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete frame yet. A
    /// buffer that reaches [`MAX_BUFFER`] without a delimiter is reset and
    /// the call fails with `FramingOverflow`.
    pub fn next_payload(&mut self) -> Result<Option<Vec<u8>>> {
        while self.scan < self.buf.len() {
            let i = self.scan;
            self.scan += 1;
            if self.buf[i] != LF {
                continue;
            }
            // Frames shorter than EOT + checksum cannot exist; a newline
            // without the EOT marker three bytes back is payload content.
            if i < 3 || self.buf[i - 3] != EOT {
                continue;
            }
            let payload = self.buf[..i].to_vec();
            self.buf.drain(..=i);
            self.scan = 0;
            return Ok(Some(payload));
        }

        if self.buf.len() >= MAX_BUFFER {
            let dropped = self.buf.len();
            self.buf.clear();
            self.scan = 0;
            return Err(SerialError::FramingOverflow(dropped));
        }

        Ok(None)
    }

    /// Bytes currently buffered without a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound framing: the payload followed by a single newline.
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 1);
    out.extend_from_slice(payload);
    out.push(LF);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_payloads_at_delimiters() {
        let mut framer = Framer::new();
        framer.push(&[0x41, 0x04, 0xAA, 0xBB, 0x0A, 0x42, 0x04, 0xCC, 0xDD, 0x0A]);
        assert_eq!(
            framer.next_payload().unwrap(),
            Some(vec![0x41, 0x04, 0xAA, 0xBB])
        );
        assert_eq!(
            framer.next_payload().unwrap(),
            Some(vec![0x42, 0x04, 0xCC, 0xDD])
        );
        assert_eq!(framer.next_payload().unwrap(), None);
        assert_eq!(framer.pending(), 0);
    }

    #[test]
    fn newline_without_eot_marker_is_payload_content() {
        let mut framer = Framer::new();
        // 0x0A at offset 2 is not preceded by EOT three bytes back
        framer.push(&[0x41, 0x42, 0x0A, 0x43, 0x04, 0xAA, 0xBB, 0x0A]);
        assert_eq!(
            framer.next_payload().unwrap(),
            Some(vec![0x41, 0x42, 0x0A, 0x43, 0x04, 0xAA, 0xBB])
        );
    }

    #[test]
    fn partial_frame_is_never_emitted() {
        let mut framer = Framer::new();
        framer.push(&[0x41, 0x04, 0xAA]);
        assert_eq!(framer.next_payload().unwrap(), None);
        assert_eq!(framer.pending(), 3);
    }

    #[test]
    fn overflow_resets_buffer() {
        let mut framer = Framer::new();
        framer.push(&vec![0x41; MAX_BUFFER]);
        assert!(matches!(
            framer.next_payload(),
            Err(SerialError::FramingOverflow(_))
        ));
        assert_eq!(framer.pending(), 0);
        // the stream is usable again after the reset
        framer.push(&[0x41, 0x04, 0xAA, 0xBB, 0x0A]);
        assert_eq!(
            framer.next_payload().unwrap(),
            Some(vec![0x41, 0x04, 0xAA, 0xBB])
        );
    }

    #[test]
    fn outbound_frame_appends_newline() {
        assert_eq!(frame(&[0x41, 0x04, 0xAA, 0xBB]), &[0x41, 0x04, 0xAA, 0xBB, 0x0A]);
    }
}
