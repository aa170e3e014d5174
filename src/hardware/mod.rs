//! Device interfaces consumed by the servers.
//!
//! The worker thread owns every device handle, so the traits take `&mut self`
//! and need no interior locking. Vendor drivers live behind these traits; the
//! crate ships simulated devices in [`mock`] and a network camera in
//! [`crate::client::CameraClient`].

pub mod mock;

pub use mock::{VirtualCamera, VirtualSlm};

use anyhow::{ensure, Result};

use crate::phase::PhaseMap;

/// A programmable phase modulator.
pub trait Slm {
    /// Width in pixels.
    fn width(&self) -> u32;
    /// Height in pixels.
    fn height(&self) -> u32;
    /// Bit depth of the phase levels.
    fn depth(&self) -> u32;
    /// Pixel pitch in micrometres.
    fn pixel_pitch_um(&self) -> f64;
    /// Wavelength the phase levels are calibrated for, in micrometres.
    fn wavelength_um(&self) -> f64;
    /// Write a phase pattern in radians, wrapped to `[0, 2π)`.
    fn display(&mut self, phase: &PhaseMap) -> Result<()>;
    /// One-line description for `id`.
    fn describe(&self) -> String;
}

/// A camera that captures single frames.
pub trait Camera {
    /// Serial or name.
    fn serial(&mut self) -> Result<String>;
    /// Free-form device information.
    fn info(&mut self) -> Result<String>;
    /// Width in pixels.
    fn width(&mut self) -> Result<u32>;
    /// Height in pixels.
    fn height(&mut self) -> Result<u32>;
    /// Bits per pixel.
    fn depth(&mut self) -> Result<u32>;
    /// Exposure in seconds.
    fn exposure(&mut self) -> Result<f64>;
    /// Set the exposure in seconds.
    fn set_exposure(&mut self, seconds: f64) -> Result<()>;
    /// Set the window of interest.
    fn set_woi(&mut self, woi: &[f64]) -> Result<()>;
    /// Capture one frame.
    fn capture(&mut self) -> Result<ImageFrame>;
    /// Drop buffered frames.
    fn flush(&mut self) -> Result<()>;
    /// Release the device.
    fn close(&mut self) -> Result<()>;
}

/// One camera frame, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFrame {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bits per pixel.
    pub depth: u32,
    /// Pixel values, `width * height` of them.
    pub pixels: Vec<u16>,
}

impl ImageFrame {
    /// Bytes per pixel on the wire.
    pub fn bytes_per_pixel(depth: u32) -> usize {
        if depth <= 8 {
            1
        } else {
            2
        }
    }

    /// Wire form: one byte per pixel up to 8 bits, otherwise little-endian `u16`.
    pub fn to_bytes(&self) -> Vec<u8> {
        if Self::bytes_per_pixel(self.depth) == 1 {
            self.pixels.iter().map(|&p| p.min(255) as u8).collect()
        } else {
            self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
        }
    }

    /// Parse the wire form of a `width` × `height` frame.
    pub fn from_bytes(width: u32, height: u32, depth: u32, bytes: &[u8]) -> Result<Self> {
        let count = width as usize * height as usize;
        let bpp = Self::bytes_per_pixel(depth);
        ensure!(
            bytes.len() == count * bpp,
            "image of {} bytes does not match {width}x{height} at {bpp} byte(s) per pixel",
            bytes.len()
        );
        let pixels = if bpp == 1 {
            bytes.iter().map(|&b| u16::from(b)).collect()
        } else {
            bytes
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect()
        };
        Ok(Self {
            width,
            height,
            depth,
            pixels,
        })
    }

    /// Sum of all pixel values.
    pub fn total(&self) -> u64 {
        self.pixels.iter().map(|&p| u64::from(p)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eight_bit_frames_use_one_byte() {
        let frame = ImageFrame {
            width: 2,
            height: 2,
            depth: 8,
            pixels: vec![0, 1, 254, 255],
        };
        let bytes = frame.to_bytes();
        assert_eq!(bytes, vec![0, 1, 254, 255]);
        assert_eq!(ImageFrame::from_bytes(2, 2, 8, &bytes).unwrap(), frame);
    }

    #[test]
    fn test_deep_frames_use_u16_le() {
        let frame = ImageFrame {
            width: 2,
            height: 1,
            depth: 12,
            pixels: vec![0x0102, 0x0fff],
        };
        assert_eq!(frame.to_bytes(), vec![0x02, 0x01, 0xff, 0x0f]);
        assert_eq!(frame.total(), 0x0102 + 0x0fff);
    }

    #[test]
    fn test_wrong_size_is_rejected() {
        assert!(ImageFrame::from_bytes(4, 4, 8, &[0u8; 15]).is_err());
        assert!(ImageFrame::from_bytes(4, 4, 16, &[0u8; 16]).is_err());
    }
}
