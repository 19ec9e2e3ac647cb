//! Framer invariants over arbitrary chunk boundaries.

use gridctl::protocol::TextCodec;
use gridctl::serial::framer::MAX_BUFFER;
use gridctl::serial::{Framer, SerialError};

#[test]
fn literal_delimiter_scenario() {
    let mut framer = Framer::new();
    framer.push(&[0x41, 0x04, 0xAA, 0xBB, 0x0A, 0x42, 0x04, 0xCC, 0xDD, 0x0A]);

    let mut payloads = Vec::new();
    while let Some(payload) = framer.next_payload().unwrap() {
        payloads.push(payload);
    }
    assert_eq!(
        payloads,
        vec![vec![0x41, 0x04, 0xAA, 0xBB], vec![0x42, 0x04, 0xCC, 0xDD]]
    );
}

#[test]
fn chunk_boundaries_do_not_change_the_payload_sequence() {
    let frames: Vec<Vec<u8>> = ["BRC SX=0 SY=0|HEARTBEAT REPORT HWCFG=1",
        "BRC SX=1 SY=0|HEARTBEAT REPORT HWCFG=0",
        "BRC SX=0 SY=0|PAGEACTIVE REPORT PAGENUMBER=2"]
    .iter()
    .map(|body| TextCodec::seal_frame(body.as_bytes()))
    .collect();

    let mut stream = Vec::new();
    for frame in &frames {
        stream.extend_from_slice(frame);
        stream.push(0x0A);
    }

    for chunk_size in 1..=17 {
        let mut framer = Framer::new();
        let mut payloads = Vec::new();
        for chunk in stream.chunks(chunk_size) {
            framer.push(chunk);
            while let Some(payload) = framer.next_payload().unwrap() {
                payloads.push(payload);
            }
        }
        assert_eq!(payloads, frames, "chunk size {}", chunk_size);
        assert_eq!(framer.pending(), 0, "chunk size {}", chunk_size);
    }
}

#[test]
fn trailing_partial_frame_is_never_emitted() {
    let sealed = TextCodec::seal_frame(b"BRC SX=0 SY=0|HEARTBEAT REPORT");
    let mut stream = sealed.clone();
    stream.push(0x0A);
    // second frame arrives without its newline
    stream.extend_from_slice(&sealed[..sealed.len() - 1]);

    let mut framer = Framer::new();
    framer.push(&stream);
    assert_eq!(framer.next_payload().unwrap(), Some(sealed.clone()));
    assert_eq!(framer.next_payload().unwrap(), None);
    assert!(framer.pending() > 0);
}

#[test]
fn oversized_buffer_without_delimiter_is_a_framing_error() {
    let mut framer = Framer::new();
    framer.push(&vec![0x55u8; MAX_BUFFER]);
    assert!(matches!(
        framer.next_payload(),
        Err(SerialError::FramingOverflow(_))
    ));
    // recovered: subsequent well-formed traffic parses
    let sealed = TextCodec::seal_frame(b"BRC SX=0 SY=0|HEARTBEAT REPORT");
    framer.push(&sealed);
    framer.push(&[0x0A]);
    assert_eq!(framer.next_payload().unwrap(), Some(sealed));
}
