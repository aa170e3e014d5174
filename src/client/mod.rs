//! Requester-side stubs.
//!
//! [`RequestClient`] issues one request on a ZMQ REQ socket and reads exactly
//! the number of reply frames the caller expects, each within a timeout. A
//! bounded timeout that expires, or a send that fails, returns the caller's
//! defaults and marks the stub disconnected for good; every later call returns
//! defaults without touching the network. Unbounded calls are reserved for
//! long-running work and never trip the disconnect rule.
//!
//! The typed wrappers build on it: [`PatternClient`], [`CameraClient`] and
//! [`FeedbackClient`].

pub mod camera;
pub mod feedback;
pub mod pattern;

pub use camera::CameraClient;
pub use feedback::FeedbackClient;
pub use pattern::PatternClient;

use tracing::{debug, warn};
use zmq::{Context, Socket};

use crate::protocol::{decode_f64, decode_f64_array, decode_i32, Frame, FrameKind};
use crate::transport::TransportError;

/// How long to wait for each reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Give up after this many milliseconds.
    Millis(u64),
    /// Wait as long as it takes.
    Unbounded,
}

impl Timeout {
    fn as_poll_ms(self) -> i64 {
        match self {
            Timeout::Millis(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            Timeout::Unbounded => -1,
        }
    }
}

/// Blocking request/reply stub over a REQ socket.
pub struct RequestClient {
    #[allow(dead_code)]
    context: Context,
    socket: Socket,
    url: String,
    connected: bool,
}

impl RequestClient {
    /// Connect a REQ socket to `url`. The peer does not need to be up yet.
    pub fn connect(url: &str) -> Result<Self, TransportError> {
        let context = Context::new();
        let connect_error = |e: zmq::Error| TransportError::Connect {
            url: url.to_string(),
            message: e.to_string(),
        };
        let socket = context.socket(zmq::REQ).map_err(connect_error)?;
        socket.set_linger(0).map_err(connect_error)?;
        socket.connect(url).map_err(connect_error)?;
        debug!(%url, "Client connected");
        Ok(Self {
            context,
            socket,
            url: url.to_string(),
            connected: true,
        })
    }

    /// Server url.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// False once a call has timed out or failed to send.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send `request` and read one reply frame per entry of `defaults`.
    ///
    /// Each returned frame takes the kind of its default. If the reply ends
    /// early the missing frames are filled from `defaults`; extra frames are
    /// discarded.
    pub fn call(&mut self, request: &[Frame], defaults: &[Frame], timeout: Timeout) -> Vec<Frame> {
        if !self.connected {
            return defaults.to_vec();
        }

        let parts: Vec<&[u8]> = request.iter().map(|f| f.bytes.as_slice()).collect();
        if let Err(e) = self.socket.send_multipart(parts, 0) {
            warn!(url = %self.url, error = %e, "Send failed; client disconnected");
            self.connected = false;
            return defaults.to_vec();
        }

        let mut reply = Vec::with_capacity(defaults.len());
        let mut more = true;
        for default in defaults {
            if !more {
                reply.push(default.clone());
                continue;
            }
            match self.socket.poll(zmq::POLLIN, timeout.as_poll_ms()) {
                Ok(n) if n > 0 => {}
                Ok(_) => {
                    if let Timeout::Millis(ms) = timeout {
                        warn!(url = %self.url, timeout_ms = ms, "Reply timed out; client disconnected");
                    }
                    self.connected = false;
                    return defaults.to_vec();
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Poll failed; client disconnected");
                    self.connected = false;
                    return defaults.to_vec();
                }
            }
            match self.socket.recv_bytes(0) {
                Ok(bytes) => {
                    reply.push(Frame {
                        kind: default.kind,
                        bytes,
                    });
                    more = self.socket.get_rcvmore().unwrap_or(false);
                }
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Receive failed; client disconnected");
                    self.connected = false;
                    return defaults.to_vec();
                }
            }
        }

        let mut dropped = 0;
        while more {
            match self.socket.recv_bytes(0) {
                Ok(_) => {
                    dropped += 1;
                    more = self.socket.get_rcvmore().unwrap_or(false);
                }
                Err(_) => break,
            }
        }
        if dropped > 0 {
            debug!(url = %self.url, dropped, "Discarded extra reply frames");
        }
        reply
    }

    /// Single text reply, or `default`.
    pub fn call_text(&mut self, request: &[Frame], default: &str, timeout: Timeout) -> String {
        let reply = self.call(request, &[Frame::text(default)], timeout);
        reply
            .first()
            .and_then(Frame::as_text)
            .unwrap_or(default)
            .to_string()
    }

    /// Single `i32` reply, or `default` if it is missing or malformed.
    pub fn call_i32(&mut self, request: &[Frame], default: i32, timeout: Timeout) -> i32 {
        let reply = self.call(request, &[Frame::i32(default)], timeout);
        reply
            .first()
            .and_then(|f| decode_i32(&f.bytes).ok())
            .unwrap_or(default)
    }

    /// Single `f64` reply, or `default` if it is missing or malformed.
    pub fn call_f64(&mut self, request: &[Frame], default: f64, timeout: Timeout) -> f64 {
        let reply = self.call(request, &[Frame::f64(default)], timeout);
        reply
            .first()
            .and_then(|f| decode_f64(&f.bytes).ok())
            .unwrap_or(default)
    }

    /// Single `f64` array reply, or `default` if it is missing or malformed.
    pub fn call_f64_array(&mut self, request: &[Frame], default: &[f64], timeout: Timeout) -> Vec<f64> {
        let reply = self.call(request, &[Frame::f64_array(default)], timeout);
        reply
            .first()
            .filter(|f| f.kind == FrameKind::Binary)
            .and_then(|f| decode_f64_array(&f.bytes).ok())
            .unwrap_or_else(|| default.to_vec())
    }
}
