//! ZMQ ROUTER implementation of [`FramedTransport`].
//!
//! Uses the `zmq` crate (C bindings) with `zmq::DONTWAIT` receives, so every
//! read is non-blocking and `EAGAIN` maps to `Ok(None)`. Blocking only happens
//! inside [`FramedTransport::poll`], which is always bounded by the caller.

use std::time::Duration;

use tracing::debug;
use zmq::{Context, Socket};

use super::{FramedTransport, TransportError};
use crate::protocol::Frame;

/// Milliseconds unsent replies may linger once the socket is closed.
const SHUTDOWN_LINGER_MS: i32 = 250;

/// A bound ZMQ ROUTER socket.
///
/// # Example
///
/// ```ignore
/// let mut router = ZmqRouter::bind("tcp://127.0.0.1:*")?;
/// if router.poll(Duration::from_millis(500))? {
///     let address = router.begin_message()?;
///     // ...
/// }
/// ```
pub struct ZmqRouter {
    #[allow(dead_code)]
    context: Context,
    socket: Socket,
    endpoint: String,
    /// The last frame read had `RCVMORE` set.
    in_message: bool,
}

impl ZmqRouter {
    /// Bind a ROUTER socket to `url`. A `tcp://host:*` wildcard port is
    /// resolved and reported by [`FramedTransport::endpoint`].
    pub fn bind(url: &str) -> Result<Self, TransportError> {
        let context = Context::new();
        let socket = context.socket(zmq::ROUTER).map_err(|e| TransportError::Bind {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        // Queued replies (the stopping notice included) get a bounded grace
        // period at close.
        socket.set_linger(SHUTDOWN_LINGER_MS).map_err(|e| TransportError::Bind {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        socket.bind(url).map_err(|e| TransportError::Bind {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let endpoint = match socket.get_last_endpoint() {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(raw)) => String::from_utf8_lossy(&raw).into_owned(),
            Err(_) => url.to_string(),
        };
        debug!(%endpoint, "Bound ROUTER socket");

        Ok(Self {
            context,
            socket,
            endpoint,
            in_message: false,
        })
    }

    fn recv_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.socket.recv_bytes(zmq::DONTWAIT) {
            Ok(bytes) => {
                self.in_message = self.socket.get_rcvmore().map_err(receive_error)?;
                Ok(Some(bytes))
            }
            Err(zmq::Error::EAGAIN) => {
                self.in_message = false;
                Ok(None)
            }
            Err(e) => {
                self.in_message = false;
                Err(receive_error(e))
            }
        }
    }
}

fn receive_error(e: zmq::Error) -> TransportError {
    match e {
        zmq::Error::ETERM | zmq::Error::ENOTSOCK => TransportError::Closed(e.to_string()),
        other => TransportError::Receive(other.to_string()),
    }
}

fn send_error(e: zmq::Error) -> TransportError {
    match e {
        zmq::Error::ETERM | zmq::Error::ENOTSOCK => TransportError::Closed(e.to_string()),
        zmq::Error::EAGAIN => TransportError::Send("socket would block".to_string()),
        other => TransportError::Send(other.to_string()),
    }
}

impl FramedTransport for ZmqRouter {
    fn poll(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
        let ready = self
            .socket
            .poll(zmq::POLLIN, timeout_ms)
            .map_err(receive_error)?;
        Ok(ready > 0)
    }

    fn begin_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.in_message {
            self.drain()?;
        }
        self.recv_frame()
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.in_message {
            return Ok(None);
        }
        self.recv_frame()
    }

    fn drain(&mut self) -> Result<usize, TransportError> {
        let mut dropped = 0;
        while self.in_message {
            if self.recv_frame()?.is_none() {
                break;
            }
            dropped += 1;
        }
        Ok(dropped)
    }

    fn send_frames(&mut self, address: &[u8], frames: &[Frame]) -> Result<(), TransportError> {
        // ROUTER response: [identity, empty delimiter, payload..]
        let mut parts: Vec<&[u8]> = Vec::with_capacity(frames.len() + 2);
        parts.push(address);
        parts.push(&[]);
        parts.extend(frames.iter().map(|f| f.bytes.as_slice()));
        self.socket
            .send_multipart(parts, zmq::DONTWAIT)
            .map_err(send_error)
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}
