use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::protocol::{self, DecodedMessage};

use super::framer::{frame, Framer};
use super::port::Transport;
use super::{Result, SerialError};

const EVENT_CAPACITY: usize = 256;
const READ_CHUNK: usize = 512;
const READ_TIMEOUT_MS: u64 = 25;

/// Signals published by the Link's reader task.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Message(DecodedMessage),
    Error(String),
    Closed,
}

/// Owns one open serial transport and turns its byte stream into decoded
/// message events.
///
/// All inbound traffic flows through a single reader task: transport bytes
/// feed the [`Framer`], each payload is decoded by the installed packet
/// codec, and every decoded message is fanned out on a broadcast channel in
/// strict arrival order.
pub struct Link {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    events: broadcast::Sender<LinkEvent>,
    shutdown: watch::Sender<bool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Link {
    /// Take ownership of an open transport and start the reader task.
    pub fn open(transport: Box<dyn Transport>) -> Arc<Self> {
        let transport = Arc::new(Mutex::new(transport));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let reader = tokio::spawn(reader_task(
            transport.clone(),
            events.clone(),
            shutdown_rx,
        ));

        Arc::new(Self {
            transport,
            events,
            shutdown,
            reader: Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// Subscribe to the decoded message stream.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Frame `payload` and send it, waiting for the OS drain.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SerialError::Cancelled);
        }
        let framed = frame(payload);
        let mut transport = self.transport.lock().await;
        transport.write_all(&framed).await
    }

    /// Await the next decoded message matching `predicate` within
    /// `timeout_ms`, else fail with `Timeout`. Closing the link resolves the
    /// wait with `Cancelled`.
    pub async fn await_message<P>(&self, predicate: P, timeout_ms: u64) -> Result<DecodedMessage>
    where
        P: Fn(&DecodedMessage) -> bool,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SerialError::Cancelled);
        }
        let mut rx = self.subscribe();
        let wait = async {
            loop {
                match rx.recv().await {
                    Ok(LinkEvent::Message(msg)) if predicate(&msg) => return Ok(msg),
                    Ok(LinkEvent::Message(_)) | Ok(LinkEvent::Error(_)) => continue,
                    Ok(LinkEvent::Closed) => return Err(SerialError::Cancelled),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Link subscriber lagged, {} messages dropped", n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(SerialError::Cancelled)
                    }
                }
            }
        };

        match timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(result) => result,
            Err(_) => Err(SerialError::Timeout),
        }
    }

    /// Stop the reader task and release the transport. Idempotent; pending
    /// `await_message` calls resolve with `Cancelled` via the `Closed` event.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.reader.lock().await.take() {
            if let Err(e) = handle.await {
                log::warn!("Link reader task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

async fn reader_task(
    transport: Arc<Mutex<Box<dyn Transport>>>,
    events: broadcast::Sender<LinkEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut framer = Framer::new();

    loop {
        let read = async {
            let mut buf = [0u8; READ_CHUNK];
            let result = {
                let mut guard = transport.lock().await;
                guard.read_chunk(&mut buf, READ_TIMEOUT_MS).await
            };
            result.map(|n| (buf, n))
        };

        tokio::select! {
            _ = shutdown.changed() => break,
            result = read => match result {
                Ok((_, 0)) => continue,
                Ok((buf, n)) => {
                    framer.push(&buf[..n]);
                    drain_frames(&mut framer, &events);
                }
                Err(e) => {
                    let _ = events.send(LinkEvent::Error(e.to_string()));
                    log::error!("Serial read failed, closing link: {}", e);
                    break;
                }
            },
        }
    }

    // remaining partial bytes are discarded, never emitted
    let _ = events.send(LinkEvent::Closed);
}

fn drain_frames(framer: &mut Framer, events: &broadcast::Sender<LinkEvent>) {
    loop {
        match framer.next_payload() {
            Ok(Some(payload)) => {
                let codec = match protocol::codec() {
                    Ok(codec) => codec,
                    Err(e) => {
                        let _ = events.send(LinkEvent::Error(e.to_string()));
                        continue;
                    }
                };
                match codec.decode_packet_frame(&payload) {
                    Ok(messages) => {
                        for msg in messages {
                            let _ = events.send(LinkEvent::Message(msg));
                        }
                    }
                    Err(e) => {
                        log::warn!("Dropping undecodable frame: {}", e);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = events.send(LinkEvent::Error(e.to_string()));
            }
        }
    }
}
