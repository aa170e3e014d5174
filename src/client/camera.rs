//! Remote camera: the [`Camera`] trait spoken over the network to a camera
//! server, so the pattern server can drive a camera owned by another process.

use anyhow::{bail, Result};

use crate::hardware::{Camera, ImageFrame};
use crate::protocol::{decode_f64, decode_i32, Frame, FrameKind, ERROR_PREFIX};
use crate::transport::TransportError;

use super::{RequestClient, Timeout};

/// [`Camera`] backed by a camera server.
pub struct CameraClient {
    inner: RequestClient,
    timeout: Timeout,
    shape: Option<(u32, u32, u32)>,
}

impl CameraClient {
    /// Connect to a camera server at `url`.
    pub fn connect(url: &str, timeout: Timeout) -> Result<Self, TransportError> {
        Ok(Self {
            inner: RequestClient::connect(url)?,
            timeout,
            shape: None,
        })
    }

    /// See [`RequestClient::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// One-frame call; fails if the stub is disconnected or the server
    /// answered with an error.
    fn request(&mut self, request: &[Frame], default: Frame) -> Result<Frame> {
        if !self.inner.is_connected() {
            bail!("camera server at {} is not responding", self.inner.url());
        }
        let expected = default.kind;
        let frame = self
            .inner
            .call(request, &[default], self.timeout)
            .into_iter()
            .next();
        if !self.inner.is_connected() {
            bail!("camera server at {} is not responding", self.inner.url());
        }
        let Some(frame) = frame else {
            bail!("camera server sent no reply");
        };
        if let Some(text) = std::str::from_utf8(&frame.bytes)
            .ok()
            .filter(|t| t.starts_with(ERROR_PREFIX))
        {
            bail!("camera server: {}", &text[ERROR_PREFIX.len()..]);
        }
        if expected == FrameKind::Text && frame.bytes.is_empty() {
            bail!("camera server does not know this command");
        }
        Ok(frame)
    }

    fn text(&mut self, command: &str) -> Result<String> {
        let frame = self.request(&[Frame::text(command)], Frame::text(""))?;
        Ok(String::from_utf8_lossy(&frame.bytes).into_owned())
    }

    fn dimension(&mut self, command: &str) -> Result<u32> {
        let frame = self.request(&[Frame::text(command)], Frame::i32(-1))?;
        let value = decode_i32(&frame.bytes)?;
        Ok(u32::try_from(value)?)
    }

    fn shape(&mut self) -> Result<(u32, u32, u32)> {
        if let Some(shape) = self.shape {
            return Ok(shape);
        }
        let shape = (
            self.dimension("get_width")?,
            self.dimension("get_height")?,
            self.dimension("get_depth")?,
        );
        self.shape = Some(shape);
        Ok(shape)
    }
}

impl Camera for CameraClient {
    fn serial(&mut self) -> Result<String> {
        self.text("get_serial")
    }

    fn info(&mut self) -> Result<String> {
        self.text("info")
    }

    fn width(&mut self) -> Result<u32> {
        Ok(self.shape()?.0)
    }

    fn height(&mut self) -> Result<u32> {
        Ok(self.shape()?.1)
    }

    fn depth(&mut self) -> Result<u32> {
        Ok(self.shape()?.2)
    }

    fn exposure(&mut self) -> Result<f64> {
        let frame = self.request(&[Frame::text("get_exposure")], Frame::f64(-1.0))?;
        Ok(decode_f64(&frame.bytes)?)
    }

    fn set_exposure(&mut self, seconds: f64) -> Result<()> {
        self.request(
            &[Frame::text("set_exposure"), Frame::f64(seconds)],
            Frame::text(""),
        )?;
        Ok(())
    }

    fn set_woi(&mut self, woi: &[f64]) -> Result<()> {
        self.request(
            &[Frame::text("set_woi"), Frame::f64_array(woi)],
            Frame::text(""),
        )?;
        self.shape = None;
        Ok(())
    }

    fn capture(&mut self) -> Result<ImageFrame> {
        let (width, height, depth) = self.shape()?;
        let frame = self.request(&[Frame::text("get_image")], Frame::binary(Vec::new()))?;
        ImageFrame::from_bytes(width, height, depth, &frame.bytes)
    }

    fn flush(&mut self) -> Result<()> {
        self.text("flush").map(|_| ())
    }

    fn close(&mut self) -> Result<()> {
        self.text("close").map(|_| ())
    }
}
