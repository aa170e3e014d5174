//! Virtual Hardware Implementations
//!
//! Provides simulated devices so every server runs without physical hardware.
//!
//! # Available Devices
//!
//! - `VirtualSlm` - Phase modulator that quantizes and keeps the last pattern
//! - `VirtualCamera` - Camera producing noisy frames whose level follows exposure
//!
//! # Defaults
//!
//! - VirtualSlm: 1272x1024, 8 bit, 12.5 µm pitch, 1.064 µm wavelength
//! - VirtualCamera: 1024x1024, 8 bit, 0.1 s exposure, serial "test_camera"

use anyhow::{ensure, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::TAU;
use tracing::debug;

use super::{Camera, ImageFrame, Slm};
use crate::phase::PhaseMap;

// =============================================================================
// VirtualSlm - Simulated Phase Modulator
// =============================================================================

/// Virtual phase modulator
///
/// Simulates an SLM with:
/// - Configurable resolution and bit depth
/// - Quantization of the written phase to `2^depth` levels
/// - A counter of written patterns for diagnostics
///
/// # Example
///
/// ```rust,ignore
/// let mut slm = VirtualSlm::new(1272, 1024, 8);
/// slm.display(&PhaseMap::zeros(1272, 1024))?;
/// assert_eq!(slm.frames_written(), 1);
/// ```
pub struct VirtualSlm {
    width: u32,
    height: u32,
    depth: u32,
    pixel_pitch_um: f64,
    wavelength_um: f64,
    levels: Option<Vec<u16>>,
    frames_written: u64,
}

impl VirtualSlm {
    /// Create a virtual SLM with default optics
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
            pixel_pitch_um: 12.5,
            wavelength_um: 1.064,
            levels: None,
            frames_written: 0,
        }
    }

    /// Set pixel pitch and wavelength, both in micrometres
    pub fn with_optics(mut self, pixel_pitch_um: f64, wavelength_um: f64) -> Self {
        self.pixel_pitch_um = pixel_pitch_um;
        self.wavelength_um = wavelength_um;
        self
    }

    /// Quantized levels of the last written pattern
    pub fn levels(&self) -> Option<&[u16]> {
        self.levels.as_deref()
    }

    /// Number of patterns written
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl Default for VirtualSlm {
    fn default() -> Self {
        Self::new(1272, 1024, 8)
    }
}

impl Slm for VirtualSlm {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn depth(&self) -> u32 {
        self.depth
    }

    fn pixel_pitch_um(&self) -> f64 {
        self.pixel_pitch_um
    }

    fn wavelength_um(&self) -> f64 {
        self.wavelength_um
    }

    fn display(&mut self, phase: &PhaseMap) -> Result<()> {
        ensure!(
            phase.width() == self.width as usize && phase.height() == self.height as usize,
            "pattern is {}x{}, SLM is {}x{}",
            phase.width(),
            phase.height(),
            self.width,
            self.height
        );
        let n_levels = 1u32 << self.depth.min(16);
        let levels = phase
            .data()
            .iter()
            .map(|p| {
                let level = (p.rem_euclid(TAU) / TAU * f64::from(n_levels)).round() as u32;
                (level % n_levels) as u16
            })
            .collect();
        self.levels = Some(levels);
        self.frames_written += 1;
        debug!(frames = self.frames_written, "VirtualSlm: pattern written");
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "virtual slm {}x{} {}bit",
            self.width, self.height, self.depth
        )
    }
}

// =============================================================================
// VirtualCamera - Simulated Camera
// =============================================================================

/// Virtual camera
///
/// Simulates a camera with:
/// - Configurable resolution and bit depth
/// - Mean signal proportional to exposure, plus uniform noise
/// - A window of interest that is stored but does not crop
/// - Frame counting for diagnostics
///
/// # Example
///
/// ```rust,ignore
/// let mut camera = VirtualCamera::new(1024, 1024, 8);
/// camera.set_exposure(0.05)?;
/// let frame = camera.capture()?;
/// assert_eq!(frame.pixels.len(), 1024 * 1024);
/// ```
pub struct VirtualCamera {
    width: u32,
    height: u32,
    depth: u32,
    exposure_s: f64,
    woi: Vec<f64>,
    frame_count: u64,
    open: bool,
    rng: StdRng,
}

impl VirtualCamera {
    /// Create a virtual camera with 0.1 s exposure
    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
            exposure_s: 0.1,
            woi: Vec::new(),
            frame_count: 0,
            open: true,
            rng: StdRng::seed_from_u64(0),
        }
    }

    /// Start from a given exposure
    pub fn with_exposure(mut self, exposure_s: f64) -> Self {
        self.exposure_s = exposure_s;
        self
    }

    /// Frames captured so far
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Last window of interest
    pub fn woi(&self) -> &[f64] {
        &self.woi
    }

    fn max_value(&self) -> u16 {
        ((1u32 << self.depth.clamp(1, 16)) - 1) as u16
    }

    fn ensure_open(&self) -> Result<()> {
        ensure!(self.open, "camera is closed");
        Ok(())
    }
}

impl Default for VirtualCamera {
    fn default() -> Self {
        Self::new(1024, 1024, 8)
    }
}

impl Camera for VirtualCamera {
    fn serial(&mut self) -> Result<String> {
        Ok("test_camera".to_string())
    }

    fn info(&mut self) -> Result<String> {
        Ok(format!(
            "virtual camera {}x{} {}bit, exposure {} s, {} frames",
            self.width, self.height, self.depth, self.exposure_s, self.frame_count
        ))
    }

    fn width(&mut self) -> Result<u32> {
        Ok(self.width)
    }

    fn height(&mut self) -> Result<u32> {
        Ok(self.height)
    }

    fn depth(&mut self) -> Result<u32> {
        Ok(self.depth)
    }

    fn exposure(&mut self) -> Result<f64> {
        Ok(self.exposure_s)
    }

    fn set_exposure(&mut self, seconds: f64) -> Result<()> {
        ensure!(
            seconds.is_finite() && seconds > 0.0,
            "exposure must be positive, got {seconds}"
        );
        self.exposure_s = seconds;
        debug!(exposure_s = seconds, "VirtualCamera: exposure set");
        Ok(())
    }

    fn set_woi(&mut self, woi: &[f64]) -> Result<()> {
        self.woi = woi.to_vec();
        debug!(?woi, "VirtualCamera: window of interest set");
        Ok(())
    }

    fn capture(&mut self) -> Result<ImageFrame> {
        self.ensure_open()?;
        let max = f64::from(self.max_value());
        // Saturates at one second.
        let mean = (self.exposure_s.min(1.0) * max * 0.5).max(1.0);
        let spread = (max * 0.05).max(1.0);
        let count = self.width as usize * self.height as usize;
        let pixels = (0..count)
            .map(|_| {
                let v = mean + self.rng.gen_range(-spread..spread);
                v.clamp(0.0, max) as u16
            })
            .collect();
        self.frame_count += 1;
        Ok(ImageFrame {
            width: self.width,
            height: self.height,
            depth: self.depth,
            pixels,
        })
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slm_quantizes_phase() {
        let mut slm = VirtualSlm::new(4, 1, 8);
        let phase = PhaseMap::from_vec(4, 1, vec![0.0, TAU / 2.0, TAU - 1e-9, -TAU / 4.0]).unwrap();
        slm.display(&phase).unwrap();
        assert_eq!(slm.levels().unwrap(), &[0, 128, 0, 192]);
        assert_eq!(slm.frames_written(), 1);
    }

    #[test]
    fn test_slm_rejects_wrong_shape() {
        let mut slm = VirtualSlm::new(4, 4, 8);
        assert!(slm.display(&PhaseMap::zeros(2, 2)).is_err());
        assert_eq!(slm.frames_written(), 0);
    }

    #[test]
    fn test_camera_defaults() {
        let mut camera = VirtualCamera::default();
        assert_eq!(camera.width().unwrap(), 1024);
        assert_eq!(camera.height().unwrap(), 1024);
        assert_eq!(camera.depth().unwrap(), 8);
        assert_eq!(camera.serial().unwrap(), "test_camera");
        assert_eq!(camera.exposure().unwrap(), 0.1);
    }

    #[test]
    fn test_camera_exposure_roundtrip() {
        let mut camera = VirtualCamera::new(8, 8, 8);
        camera.set_exposure(0.05).unwrap();
        assert_eq!(camera.exposure().unwrap(), 0.05);
        assert!(camera.set_exposure(0.0).is_err());
        assert!(camera.set_exposure(f64::NAN).is_err());
        assert_eq!(camera.exposure().unwrap(), 0.05);
    }

    #[test]
    fn test_longer_exposure_is_brighter() {
        let mut camera = VirtualCamera::new(16, 16, 12);
        camera.set_exposure(0.01).unwrap();
        let dim = camera.capture().unwrap();
        camera.set_exposure(0.5).unwrap();
        let bright = camera.capture().unwrap();
        assert!(bright.total() > dim.total());
        assert!(bright.pixels.iter().all(|&p| p <= 4095));
        assert_eq!(camera.frame_count(), 2);
    }

    #[test]
    fn test_closed_camera_cannot_capture() {
        let mut camera = VirtualCamera::new(2, 2, 8);
        camera.close().unwrap();
        assert!(camera.capture().is_err());
    }
}
