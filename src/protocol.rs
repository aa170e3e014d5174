//! Wire format shared by the servers and the client stubs.
//!
//! A request on the wire is `[origin address][""][command][arg0]..[argN]`;
//! the transport strips the first two frames. A reply is
//! `[origin address][""][reply0]..[replyM]` where each reply frame is tagged
//! with a [`FrameKind`] by the command that produced it.
//!
//! Numeric payloads are little-endian with no length prefix:
//! - `i32` for dimensions and bit depth
//! - `f64` for physical quantities (exposure, coordinates, weights)
//! - `f64` arrays, reshaped by each command from a statically known shape
//! - a single `u8` for iteration counts

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Reply sent when a message arrives without a readable command frame.
pub const SEND_MORE: &str = "Send more";
/// Reply sent for a command name the catalog does not know.
pub const UNKNOWN_COMMAND: &str = "";
/// Confirmation text used by setters and actions.
pub const OK: &str = "ok";
/// Reply flushed to a parked client when the server stops underneath it.
pub const STOPPING: &str = "error: server stopping";
/// Prefix of every handler-level error reply.
pub const ERROR_PREFIX: &str = "error: ";

/// Wire encoding of a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameKind {
    /// Raw bytes.
    Binary = 0,
    /// UTF-8 text.
    Text = 1,
}

/// One tagged frame of a request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// How the bytes are meant to be read.
    pub kind: FrameKind,
    /// Frame payload.
    pub bytes: Vec<u8>,
}

impl Frame {
    /// Text frame.
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Text,
            bytes: value.into().into_bytes(),
        }
    }

    /// Binary frame.
    pub fn binary(bytes: Vec<u8>) -> Self {
        Self {
            kind: FrameKind::Binary,
            bytes,
        }
    }

    /// Little-endian `i32` frame.
    pub fn i32(value: i32) -> Self {
        Self::binary(value.to_le_bytes().to_vec())
    }

    /// Little-endian `f64` frame.
    pub fn f64(value: f64) -> Self {
        Self::binary(value.to_le_bytes().to_vec())
    }

    /// Raw little-endian `f64` array frame.
    pub fn f64_array(values: &[f64]) -> Self {
        Self::binary(encode_f64_array(values))
    }

    /// Text view of the frame, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

/// Ordered reply frames for one request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Reply {
    frames: Vec<Frame>,
}

impl Reply {
    /// Reply made of the given frames.
    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self { frames }
    }

    /// Single text frame.
    pub fn text(value: impl Into<String>) -> Self {
        Self::from_frames(vec![Frame::text(value)])
    }

    /// The `"ok"` confirmation.
    pub fn ok() -> Self {
        Self::text(OK)
    }

    /// `error: <message>` text reply.
    pub fn error(message: impl fmt::Display) -> Self {
        Self::text(format!("{ERROR_PREFIX}{message}"))
    }

    /// Single binary frame.
    pub fn binary(bytes: Vec<u8>) -> Self {
        Self::from_frames(vec![Frame::binary(bytes)])
    }

    /// Single `i32` frame.
    pub fn i32(value: i32) -> Self {
        Self::from_frames(vec![Frame::i32(value)])
    }

    /// Single `f64` frame.
    pub fn f64(value: f64) -> Self {
        Self::from_frames(vec![Frame::f64(value)])
    }

    /// Single `f64` array frame.
    pub fn f64_array(values: &[f64]) -> Self {
        Self::from_frames(vec![Frame::f64_array(values)])
    }

    /// Append a frame.
    pub fn with(mut self, frame: Frame) -> Self {
        self.frames.push(frame);
        self
    }

    /// Frames in send order.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// Kind tags in send order.
    pub fn kinds(&self) -> Vec<FrameKind> {
        self.frames.iter().map(|f| f.kind).collect()
    }

    /// True if this is an `error: ...` text reply.
    pub fn is_error(&self) -> bool {
        matches!(
            self.frames.as_slice(),
            [frame] if frame.kind == FrameKind::Text
                && frame.as_text().is_some_and(|t| t.starts_with(ERROR_PREFIX))
        )
    }
}

/// Errors decoding argument frames or encoding deferred payloads.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// Fixed-size value with the wrong number of bytes.
    #[error("expected {expected} bytes for {what}, got {actual}")]
    Length {
        /// Value being decoded.
        what: &'static str,
        /// Required byte count.
        expected: usize,
        /// Received byte count.
        actual: usize,
    },

    /// Array whose length is not a whole number of elements.
    #[error("{what} payload of {len} bytes is not a multiple of {width}")]
    Misaligned {
        /// Value being decoded.
        what: &'static str,
        /// Received byte count.
        len: usize,
        /// Element width in bytes.
        width: usize,
    },

    /// Text frame that is not UTF-8.
    #[error("frame is not valid UTF-8")]
    Utf8,

    /// Declared argument frame missing from the message.
    #[error("missing argument {index} ({kind:?})")]
    MissingArg {
        /// Zero-based argument position.
        index: usize,
        /// Declared kind.
        kind: ArgKind,
    },

    /// Handler asked for an argument with a different kind than declared.
    #[error("argument {index} is not {expected:?}")]
    ArgType {
        /// Zero-based argument position.
        index: usize,
        /// Kind the handler asked for.
        expected: ArgKind,
    },

    /// Deferred payload does not fit the command's reply shape.
    #[error("payload {found} does not fit reply shape {expected:?}")]
    PayloadShape {
        /// Shape the command declares.
        expected: ReplyShape,
        /// Variant that was supplied.
        found: &'static str,
    },

    /// Array element that cannot stand for a byte of a binary reply.
    #[error("value {value} at index {index} is not a byte (0..=255)")]
    NotAByte {
        /// Position in the supplied array.
        index: usize,
        /// Offending value.
        value: f64,
    },
}

/// Decode a little-endian `i32`.
pub fn decode_i32(bytes: &[u8]) -> Result<i32, CodecError> {
    fixed_width(bytes, 4, "i32")?;
    let mut buf = bytes;
    Ok(buf.get_i32_le())
}

/// Decode a little-endian `f64`.
pub fn decode_f64(bytes: &[u8]) -> Result<f64, CodecError> {
    fixed_width(bytes, 8, "f64")?;
    let mut buf = bytes;
    Ok(buf.get_f64_le())
}

/// Decode a single-byte count.
pub fn decode_u8(bytes: &[u8]) -> Result<u8, CodecError> {
    fixed_width(bytes, 1, "u8")?;
    Ok(bytes[0])
}

/// Decode a raw little-endian `f64` array.
pub fn decode_f64_array(bytes: &[u8]) -> Result<Vec<f64>, CodecError> {
    if bytes.len() % 8 != 0 {
        return Err(CodecError::Misaligned {
            what: "f64 array",
            len: bytes.len(),
            width: 8,
        });
    }
    let mut buf = bytes;
    let mut values = Vec::with_capacity(bytes.len() / 8);
    while buf.has_remaining() {
        values.push(buf.get_f64_le());
    }
    Ok(values)
}

/// Encode a raw little-endian `f64` array.
pub fn encode_f64_array(values: &[f64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 8);
    for value in values {
        out.put_f64_le(*value);
    }
    out
}

/// Decode a UTF-8 text frame.
pub fn decode_text(bytes: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Utf8)
}

fn fixed_width(bytes: &[u8], expected: usize, what: &'static str) -> Result<(), CodecError> {
    if bytes.len() == expected {
        Ok(())
    } else {
        Err(CodecError::Length {
            what,
            expected,
            actual: bytes.len(),
        })
    }
}

/// Declared kind of one argument frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArgKind {
    /// UTF-8 string.
    Text,
    /// Little-endian `i32`.
    I32,
    /// Single byte.
    U8,
    /// Little-endian `f64`.
    F64,
    /// Raw little-endian `f64` array.
    F64Array,
    /// Opaque bytes.
    Bytes,
}

impl ArgKind {
    /// Decode one frame according to this kind.
    pub fn decode(self, bytes: &[u8]) -> Result<Arg, CodecError> {
        Ok(match self {
            ArgKind::Text => Arg::Text(decode_text(bytes)?),
            ArgKind::I32 => Arg::I32(decode_i32(bytes)?),
            ArgKind::U8 => Arg::U8(decode_u8(bytes)?),
            ArgKind::F64 => Arg::F64(decode_f64(bytes)?),
            ArgKind::F64Array => Arg::F64Array(decode_f64_array(bytes)?),
            ArgKind::Bytes => Arg::Bytes(bytes.to_vec()),
        })
    }
}

/// One decoded argument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Arg {
    /// UTF-8 string.
    Text(String),
    /// Signed integer.
    I32(i32),
    /// Byte count.
    U8(u8),
    /// Scalar quantity.
    F64(f64),
    /// Flat array, reshaped by the handler.
    F64Array(Vec<f64>),
    /// Opaque bytes.
    Bytes(Vec<u8>),
}

/// Decoded arguments of one request, in frame order.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(transparent)]
pub struct Args(Vec<Arg>);

impl Args {
    /// Wrap decoded arguments.
    pub fn new(args: Vec<Arg>) -> Self {
        Self(args)
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when the command takes no arguments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// All arguments.
    pub fn as_slice(&self) -> &[Arg] {
        &self.0
    }

    /// Text argument at `index`.
    pub fn text(&self, index: usize) -> Result<&str, CodecError> {
        match self.0.get(index) {
            Some(Arg::Text(s)) => Ok(s),
            _ => Err(self.type_error(index, ArgKind::Text)),
        }
    }

    /// `f64` argument at `index`.
    pub fn f64(&self, index: usize) -> Result<f64, CodecError> {
        match self.0.get(index) {
            Some(Arg::F64(v)) => Ok(*v),
            _ => Err(self.type_error(index, ArgKind::F64)),
        }
    }

    /// `f64` array argument at `index`.
    pub fn f64_array(&self, index: usize) -> Result<&[f64], CodecError> {
        match self.0.get(index) {
            Some(Arg::F64Array(v)) => Ok(v),
            _ => Err(self.type_error(index, ArgKind::F64Array)),
        }
    }

    /// `u8` argument at `index`.
    pub fn u8(&self, index: usize) -> Result<u8, CodecError> {
        match self.0.get(index) {
            Some(Arg::U8(v)) => Ok(*v),
            _ => Err(self.type_error(index, ArgKind::U8)),
        }
    }

    /// `i32` argument at `index`.
    pub fn i32(&self, index: usize) -> Result<i32, CodecError> {
        match self.0.get(index) {
            Some(Arg::I32(v)) => Ok(*v),
            _ => Err(self.type_error(index, ArgKind::I32)),
        }
    }

    fn type_error(&self, index: usize, expected: ArgKind) -> CodecError {
        if index >= self.0.len() {
            CodecError::MissingArg {
                index,
                kind: expected,
            }
        } else {
            CodecError::ArgType { index, expected }
        }
    }
}

/// Value supplied by a completer for a parked request.
///
/// Untagged so the file mailbox can carry plain JSON values:
/// `"ok"`, `0.05`, `[1.0, 1.0, 1.0]`. A binary reply arrives from JSON as an
/// array of integers `0..=255`, which [`ReplyShape::Binary`] turns into bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    /// Text value.
    Text(String),
    /// Scalar value.
    F64(f64),
    /// Array value.
    F64Array(Vec<f64>),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Payload {
    fn variant(&self) -> &'static str {
        match self {
            Payload::Text(_) => "Text",
            Payload::F64(_) => "F64",
            Payload::F64Array(_) => "F64Array",
            Payload::Bytes(_) => "Bytes",
        }
    }
}

/// Fixed reply shape of a deferred command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyShape {
    /// One text frame.
    Text,
    /// One `f64` frame.
    F64,
    /// One `f64` array frame.
    F64Array,
    /// One raw binary frame.
    Binary,
}

impl ReplyShape {
    /// Build the wire reply for a completion payload.
    pub fn encode(self, payload: Payload) -> Result<Reply, CodecError> {
        match (self, payload) {
            (ReplyShape::Text, Payload::Text(text)) => Ok(Reply::text(text)),
            (ReplyShape::F64, Payload::F64(value)) => Ok(Reply::f64(value)),
            (ReplyShape::F64, Payload::F64Array(values)) if values.len() == 1 => {
                Ok(Reply::f64(values[0]))
            }
            (ReplyShape::F64Array, Payload::F64Array(values)) => Ok(Reply::f64_array(&values)),
            (ReplyShape::F64Array, Payload::F64(value)) => Ok(Reply::f64_array(&[value])),
            (ReplyShape::Binary, Payload::Bytes(bytes)) => Ok(Reply::binary(bytes)),
            (ReplyShape::Binary, Payload::F64Array(values)) => {
                Ok(Reply::binary(byte_values(&values)?))
            }
            (expected, other) => Err(CodecError::PayloadShape {
                expected,
                found: other.variant(),
            }),
        }
    }
}

fn byte_values(values: &[f64]) -> Result<Vec<u8>, CodecError> {
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            if value.fract() == 0.0 && (0.0..=255.0).contains(&value) {
                Ok(value as u8)
            } else {
                Err(CodecError::NotAByte { index, value })
            }
        })
        .collect()
}
