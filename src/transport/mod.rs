//! # Transport Adapter
//!
//! A [`Transport`] knows how to open a link to the local radio; each successful
//! [`Transport::open`] yields a fresh [`LinkHandle`] that owns the outbound side and carries
//! the inbound frame stream for that one link.
//!
//! Frames crossing this boundary are bare protobuf payloads: any link-level wrapping (the
//! serial `0x94 0xC3` header) is applied and stripped inside the implementation.
//!
//! The stream is not restartable. It yields `Ok(frame)` until the link is closed or fails;
//! a failure is reported once as `Err(TransportError)` and the stream then ends. Reopening is
//! the caller's job: adapters never retry on their own.

pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;

use crate::error::TransportError;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use mock::MockTransport;
#[cfg(feature = "serial")]
pub use serial::{list_ports, SerialTransport};

/// Result of reading one frame off a link.
pub type FrameResult = Result<Vec<u8>, TransportError>;

/// Inbound side of one link.
pub type FrameStream = mpsc::Receiver<FrameResult>;

/// Factory for links to the local radio.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Open a new link. Every call is a fresh attempt; a previously returned handle is not
    /// reused.
    async fn open(&mut self) -> Result<LinkHandle, TransportError>;

    /// Short human-readable name (device path, "mock").
    fn describe(&self) -> String;
}

/// Outbound half of an open link, implemented per transport.
#[async_trait]
pub trait Link: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Cheap local check; `false` once the implementation has observed the link die.
    fn is_alive(&self) -> bool;

    async fn close(&mut self);
}

/// One open link: outbound operations plus its inbound frame stream.
pub struct LinkHandle {
    link: Box<dyn Link>,
    frames: FrameStream,
    closed: bool,
}

impl LinkHandle {
    pub fn new(link: Box<dyn Link>, frames: FrameStream) -> Self {
        Self {
            link,
            frames,
            closed: false,
        }
    }

    pub async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Io("link is closed".into()));
        }
        self.link.send_frame(frame).await
    }

    pub fn is_alive(&self) -> bool {
        !self.closed && self.link.is_alive()
    }

    /// Next inbound frame; `None` once the stream has ended.
    pub async fn next_frame(&mut self) -> Option<FrameResult> {
        if self.closed {
            return None;
        }
        self.frames.recv().await
    }

    pub async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.frames.close();
            self.link.close().await;
        }
    }
}

impl std::fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkHandle")
            .field("alive", &self.is_alive())
            .finish()
    }
}
