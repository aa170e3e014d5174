//! Client for the feedback (imaging-detector) server.
//!
//! `get_spot_amps` is answered by an external program, so its call uses a
//! configurable bounded timeout and falls back to `[-1.0]`.

use crate::protocol::Frame;
use crate::transport::TransportError;

use super::{RequestClient, Timeout};

/// Reply used when no spot amplitudes arrive.
pub const NO_SPOT_AMPS: [f64; 1] = [-1.0];

/// Typed stub for the feedback server.
pub struct FeedbackClient {
    inner: RequestClient,
    timeout: Timeout,
}

impl FeedbackClient {
    /// Connect with a 1000 ms per-frame timeout.
    pub fn connect(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            inner: RequestClient::connect(url)?,
            timeout: Timeout::Millis(1000),
        })
    }

    /// Replace the per-frame timeout.
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// See [`RequestClient::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Server description.
    pub fn id(&mut self) -> String {
        self.inner.call_text(&[Frame::text("id")], "", self.timeout)
    }

    /// Ask for the measured spot amplitudes of `scan_name` in `scan_file`,
    /// averaged over `averages` shots.
    pub fn get_spot_amps(&mut self, scan_file: &str, scan_name: &str, averages: f64) -> Vec<f64> {
        self.inner.call_f64_array(
            &[
                Frame::text("get_spot_amps"),
                Frame::text(scan_file),
                Frame::text(scan_name),
                Frame::f64(averages),
            ],
            &NO_SPOT_AMPS,
            self.timeout,
        )
    }

    /// Exposure reported by the detector, or `-1.0`.
    pub fn get_exposure(&mut self) -> f64 {
        self.inner
            .call_f64(&[Frame::text("get_exposure")], -1.0, self.timeout)
    }

    /// Ask the detector to change exposure.
    pub fn set_exposure(&mut self, seconds: f64) -> String {
        self.inner.call_text(
            &[Frame::text("set_exposure"), Frame::f64(seconds)],
            "",
            self.timeout,
        )
    }

    /// Raw detector image; empty if unavailable.
    pub fn get_image(&mut self) -> Vec<u8> {
        let reply = self.inner.call(
            &[Frame::text("get_image")],
            &[Frame::binary(Vec::new())],
            self.timeout,
        );
        reply.into_iter().next().map(|f| f.bytes).unwrap_or_default()
    }
}
