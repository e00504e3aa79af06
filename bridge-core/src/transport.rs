// Physical transports: extension ports and the page window
//
// A port is a bidirectional frame pipe between two contexts. The window is a
// shared broadcast surface: every listener, including the poster, sees every
// message, which is why direction tags exist.

use crate::error::TransportError;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// Outbound half of a port.
pub trait FrameSink: Send {
    fn post(&mut self, frame: Vec<u8>) -> Result<(), TransportError>;
}

/// Inbound half of a port. `None` means the peer disconnected.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Option<Vec<u8>>;
}

/// Both halves of one end of a port.
pub struct Transport {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl Transport {
    pub fn new(sink: impl FrameSink + 'static, source: impl FrameSource + 'static) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
        }
    }

    /// Two connected in-memory ends, one per context.
    pub fn pair() -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Transport::new(ChannelSink(a_tx), ChannelSource(a_rx)),
            Transport::new(ChannelSink(b_tx), ChannelSource(b_rx)),
        )
    }
}

pub struct ChannelSink(pub mpsc::UnboundedSender<Vec<u8>>);

impl FrameSink for ChannelSink {
    fn post(&mut self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.0.send(frame).map_err(|_| TransportError::Closed)
    }
}

pub struct ChannelSource(pub mpsc::UnboundedReceiver<Vec<u8>>);

#[async_trait]
impl FrameSource for ChannelSource {
    async fn next_frame(&mut self) -> Option<Vec<u8>> {
        self.0.recv().await
    }
}

const WINDOW_CAPACITY: usize = 256;

/// A `window.postMessage` event as the receiver observes it.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowMessage {
    /// Filled in by the window from the posting frame, never by the poster
    pub origin: String,
    pub data: Value,
}

/// In-memory stand-in for the page's window messaging surface.
#[derive(Clone)]
pub struct PageWindow {
    origin: String,
    tx: broadcast::Sender<WindowMessage>,
}

impl PageWindow {
    pub fn new(origin: impl Into<String>) -> Self {
        let (tx, _) = broadcast::channel(WINDOW_CAPACITY);
        Self {
            origin: origin.into(),
            tx,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Post from the top-level document.
    pub fn post(&self, data: Value) -> Result<(), TransportError> {
        self.post_from(self.origin.clone(), data)
    }

    /// Post from a frame with a different origin (e.g. an embedded iframe).
    pub fn post_from(&self, origin: impl Into<String>, data: Value) -> Result<(), TransportError> {
        self.tx
            .send(WindowMessage {
                origin: origin.into(),
                data,
            })
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowMessage> {
        self.tx.subscribe()
    }
}
