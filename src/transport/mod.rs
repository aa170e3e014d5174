//! Framed, addressed transport owned by a single worker thread.
//!
//! The transport is a router endpoint: many requester peers connect, and each
//! inbound message starts with an opaque origin address that routes the reply
//! back to its peer. It holds no business state.
//!
//! Absence of data is never an error. `begin_message` and `next_frame` return
//! `Ok(None)` when nothing is available, which keeps "no frame" apart from a
//! zero-length frame (`Ok(Some(vec![]))`) and from a broken socket (`Err`).

pub mod zmq_router;

pub use zmq_router::ZmqRouter;

use std::time::Duration;
use thiserror::Error;

use crate::protocol::Frame;

/// Transport failures. Timeouts and empty reads are not represented here.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint url could not be bound.
    #[error("cannot bind {url}: {message}")]
    Bind {
        /// Url that was requested.
        url: String,
        /// Underlying socket error.
        message: String,
    },

    /// The endpoint could not be reached by a client.
    #[error("cannot connect to {url}: {message}")]
    Connect {
        /// Url that was requested.
        url: String,
        /// Underlying socket error.
        message: String,
    },

    /// Socket or context was closed underneath the owner.
    #[error("transport closed: {0}")]
    Closed(String),

    /// Receive failed for a reason other than "no data".
    #[error("receive failed: {0}")]
    Receive(String),

    /// Send failed.
    #[error("send failed: {0}")]
    Send(String),
}

impl TransportError {
    /// A closed transport cannot recover; the worker loop ends on it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Closed(_) | TransportError::Bind { .. })
    }
}

/// Duplex, addressed, multi-frame transport.
///
/// Implementations are owned by exactly one thread. `Send` lets the owner be
/// moved onto the worker thread, nothing more.
pub trait FramedTransport: Send {
    /// Wait up to `timeout` for inbound data.
    fn poll(&mut self, timeout: Duration) -> Result<bool, TransportError>;

    /// Non-blocking read of the first frame (origin address) of the next message.
    ///
    /// Leftover frames of the previous message are discarded first.
    fn begin_message(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Non-blocking read of the next frame of the current message.
    ///
    /// Returns `Ok(None)` once the current message is exhausted; it never
    /// reads into the next message.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError>;

    /// Discard the remaining frames of the current message. Returns how many
    /// frames were dropped.
    fn drain(&mut self) -> Result<usize, TransportError>;

    /// Send `[address][""][frames..]`.
    fn send_frames(&mut self, address: &[u8], frames: &[Frame]) -> Result<(), TransportError>;

    /// Resolved endpoint, e.g. `tcp://127.0.0.1:41235`.
    fn endpoint(&self) -> &str;
}
