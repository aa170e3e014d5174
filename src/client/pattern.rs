//! Client for the pattern server.

use crate::protocol::{encode_f64_array, Frame, ERROR_PREFIX, OK};
use crate::transport::TransportError;

use super::{RequestClient, Timeout};

/// Default per-frame timeout for housekeeping calls.
pub const DEFAULT_TIMEOUT: Timeout = Timeout::Millis(1000);

/// Typed stub for the pattern server. Every method returns its default
/// (`""` for text, `-1` for numbers) once the stub is disconnected.
pub struct PatternClient {
    inner: RequestClient,
    timeout: Timeout,
}

impl PatternClient {
    /// Connect to a pattern server.
    pub fn connect(url: &str) -> Result<Self, TransportError> {
        Ok(Self {
            inner: RequestClient::connect(url)?,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Use a different timeout for bounded calls.
    pub fn with_timeout(mut self, timeout: Timeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// See [`RequestClient::is_connected`].
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Server description. Works as a handshake.
    pub fn id(&mut self) -> String {
        self.inner.call_text(&[Frame::text("id")], "", self.timeout)
    }

    /// Load a saved pattern as the base phase and project it.
    pub fn use_pattern(&mut self, path: &str) -> String {
        self.inner.call_text(
            &[Frame::text("use_pattern"), Frame::text(path)],
            "",
            self.timeout,
        )
    }

    /// Compute a hologram for `targets` (`[x0..xN, y0..yN]`) with relative
    /// `amps`. `iterations == 0` uses the server default. Waits without limit.
    pub fn calculate(&mut self, targets: &[f64], amps: &[f64], iterations: u8) -> String {
        self.inner.call_text(
            &[
                Frame::text("calculate"),
                Frame::binary(encode_f64_array(targets)),
                Frame::binary(encode_f64_array(amps)),
                Frame::binary(vec![iterations]),
            ],
            "",
            Timeout::Unbounded,
        )
    }

    /// Save the last calculation. Returns `(config path, pattern path)`.
    pub fn save_calculation(&mut self, path: &str, name: &str) -> (String, String) {
        let reply = self.inner.call(
            &[
                Frame::text("save_calculation"),
                Frame::text(path),
                Frame::text(name),
            ],
            &[Frame::text(""), Frame::text("")],
            Timeout::Unbounded,
        );
        let text = |i: usize| {
            reply
                .get(i)
                .and_then(Frame::as_text)
                .unwrap_or_default()
                .to_string()
        };
        (text(0), text(1))
    }

    /// Calculate, save under `path`/`name`, then load the saved pattern and
    /// project it.
    ///
    /// Returns `(config path, pattern path)`, or the first reply that was not
    /// a success.
    pub fn calculate_save_and_project(
        &mut self,
        targets: &[f64],
        amps: &[f64],
        iterations: u8,
        path: &str,
        name: &str,
    ) -> Result<(String, String), String> {
        expect_ok(self.calculate(targets, amps, iterations))?;
        let (config_path, pattern_path) = self.save_calculation(path, name);
        if config_path.is_empty() || config_path.starts_with(ERROR_PREFIX) {
            return Err(config_path);
        }
        self.load_and_project(&pattern_path)?;
        Ok((config_path, pattern_path))
    }

    /// Load a saved pattern and project it.
    pub fn load_and_project(&mut self, path: &str) -> Result<(), String> {
        expect_ok(self.use_pattern(path))?;
        expect_ok(self.project())
    }

    /// Add a Fresnel lens with focal length in millimetres.
    pub fn add_fresnel_lens(&mut self, focal_length_mm: f64) -> String {
        self.inner.call_text(
            &[Frame::text("add_fresnel_lens"), Frame::f64(focal_length_mm)],
            "",
            self.timeout,
        )
    }

    /// Add Zernike polynomials given as `(n, m, weight)` triples.
    pub fn add_zernike_poly(&mut self, terms: &[(u32, i32, f64)]) -> String {
        let flat: Vec<f64> = terms
            .iter()
            .flat_map(|&(n, m, w)| [f64::from(n), f64::from(m), w])
            .collect();
        self.inner.call_text(
            &[Frame::text("add_zernike_poly"), Frame::f64_array(&flat)],
            "",
            self.timeout,
        )
    }

    /// Clear every added correction.
    pub fn reset_additional_phase(&mut self) -> String {
        self.inner
            .call_text(&[Frame::text("reset_additional_phase")], "", self.timeout)
    }

    /// Clear the base phase.
    pub fn reset_pattern(&mut self) -> String {
        self.inner
            .call_text(&[Frame::text("reset_pattern")], "", self.timeout)
    }

    /// Write base plus additional phase to the modulator.
    pub fn project(&mut self) -> String {
        self.inner.call_text(&[Frame::text("project")], "", self.timeout)
    }

    /// Description of base and added phase.
    pub fn get_current_phase_info(&mut self) -> String {
        self.inner
            .call_text(&[Frame::text("get_current_phase_info")], "", self.timeout)
    }

    /// Modulator `(width, height)`.
    pub fn get_slm_shape(&mut self) -> (i32, i32) {
        let reply = self.inner.call(
            &[Frame::text("get_slm_shape")],
            &[Frame::i32(-1), Frame::i32(-1)],
            self.timeout,
        );
        let value = |i: usize| {
            reply
                .get(i)
                .and_then(|f| crate::protocol::decode_i32(&f.bytes).ok())
                .unwrap_or(-1)
        };
        (value(0), value(1))
    }

    /// Camera width.
    pub fn get_width(&mut self) -> i32 {
        self.inner.call_i32(&[Frame::text("get_width")], -1, self.timeout)
    }

    /// Camera height.
    pub fn get_height(&mut self) -> i32 {
        self.inner.call_i32(&[Frame::text("get_height")], -1, self.timeout)
    }

    /// Camera bit depth.
    pub fn get_depth(&mut self) -> i32 {
        self.inner.call_i32(&[Frame::text("get_depth")], -1, self.timeout)
    }

    /// Camera exposure in seconds.
    pub fn get_exposure(&mut self) -> f64 {
        self.inner
            .call_f64(&[Frame::text("get_exposure")], -1.0, self.timeout)
    }

    /// Set the camera exposure in seconds.
    pub fn set_exposure(&mut self, seconds: f64) -> String {
        self.inner.call_text(
            &[Frame::text("set_exposure"), Frame::f64(seconds)],
            "",
            self.timeout,
        )
    }

    /// Raw camera frame bytes; empty if unavailable.
    pub fn get_image(&mut self) -> Vec<u8> {
        let reply = self.inner.call(
            &[Frame::text("get_image")],
            &[Frame::binary(Vec::new())],
            self.timeout,
        );
        reply.into_iter().next().map(|f| f.bytes).unwrap_or_default()
    }
}

fn expect_ok(reply: String) -> Result<(), String> {
    if reply == OK {
        Ok(())
    } else {
        Err(reply)
    }
}
