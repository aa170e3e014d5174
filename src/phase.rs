//! Phase bookkeeping for the modulator.
//!
//! The projected phase is `base + additional`. The base comes from a hologram
//! calculation or a saved pattern. The additional phase accumulates
//! corrections (Fresnel lenses, Zernike polynomials) and keeps a log of what
//! was added so `get_current_phase_info` can describe it.

use std::f64::consts::{PI, TAU};
use std::fmt;

use anyhow::{bail, ensure, Result};
use serde::{Deserialize, Serialize};

/// Row-major phase in radians.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawPhaseMap")]
pub struct PhaseMap {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl PhaseMap {
    /// Flat zero phase.
    pub fn zeros(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; width * height],
        }
    }

    /// Wrap row-major values.
    pub fn from_vec(width: usize, height: usize, data: Vec<f64>) -> Result<Self> {
        ensure!(
            width.checked_mul(height) == Some(data.len()),
            "phase of {} values does not match {width}x{height}",
            data.len()
        );
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Build from a function of pixel coordinates.
    pub fn from_fn(width: usize, height: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            data,
        }
    }

    /// Width in pixels.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Height in pixels.
    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major values.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Value at `(x, y)`.
    pub fn get(&self, x: usize, y: usize) -> Option<f64> {
        (x < self.width && y < self.height).then(|| self.data[y * self.width + x])
    }

    /// Add `other` in place.
    pub fn add_assign(&mut self, other: &PhaseMap) -> Result<()> {
        ensure!(
            self.width == other.width && self.height == other.height,
            "cannot add {}x{} phase to {}x{} phase",
            other.width,
            other.height,
            self.width,
            self.height
        );
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += b;
        }
        Ok(())
    }

    /// Copy wrapped to `[0, 2π)`.
    pub fn wrapped(&self) -> PhaseMap {
        PhaseMap {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|p| p.rem_euclid(TAU)).collect(),
        }
    }
}

/// Wire form of [`PhaseMap`], checked on the way in.
#[derive(Deserialize)]
struct RawPhaseMap {
    width: usize,
    height: usize,
    data: Vec<f64>,
}

impl TryFrom<RawPhaseMap> for PhaseMap {
    type Error = anyhow::Error;

    fn try_from(raw: RawPhaseMap) -> Result<Self> {
        PhaseMap::from_vec(raw.width, raw.height, raw.data)
    }
}

/// One entry of the additional-phase log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PhaseTerm {
    /// Fresnel lens with focal length in millimetres.
    FresnelLens {
        /// Focal length in millimetres.
        focal_length_mm: f64,
    },
    /// Weighted sum of Zernike polynomials.
    Zernike(Vec<ZernikeTerm>),
}

impl fmt::Display for PhaseTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseTerm::FresnelLens { focal_length_mm } => {
                write!(f, "fresnel_lens({focal_length_mm} mm)")
            }
            PhaseTerm::Zernike(terms) => {
                let parts: Vec<String> = terms
                    .iter()
                    .map(|t| format!("({}, {}, {})", t.n, t.m, t.weight))
                    .collect();
                write!(f, "zernike[{}]", parts.join(", "))
            }
        }
    }
}

/// Highest accepted Zernike radial order.
pub const MAX_ZERNIKE_ORDER: u32 = 20;

/// Zernike polynomial `Z_n^m` with a weight in radians.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ZernikeTerm {
    /// Radial order.
    pub n: u32,
    /// Azimuthal order, `|m| <= n` and `n - |m|` even.
    pub m: i32,
    /// Coefficient in radians.
    pub weight: f64,
}

impl ZernikeTerm {
    /// Parse a flat `[n, m, weight, n, m, weight, ..]` array.
    pub fn from_triples(values: &[f64]) -> Result<Vec<Self>> {
        ensure!(
            values.len() % 3 == 0,
            "zernike array of {} values is not a list of (n, m, weight) triples",
            values.len()
        );
        values
            .chunks_exact(3)
            .map(|c| {
                let (n, m, weight) = (c[0], c[1], c[2]);
                ensure!(
                    n.fract() == 0.0 && m.fract() == 0.0 && n >= 0.0,
                    "zernike indices must be integers, got ({n}, {m})"
                );
                let max = f64::from(MAX_ZERNIKE_ORDER);
                ensure!(
                    n <= max && m.abs() <= max,
                    "zernike order ({n}, {m}) exceeds the maximum of {MAX_ZERNIKE_ORDER}"
                );
                let term = ZernikeTerm {
                    n: n as u32,
                    m: m as i32,
                    weight,
                };
                term.check()?;
                Ok(term)
            })
            .collect()
    }

    fn check(&self) -> Result<()> {
        ensure!(
            self.n <= MAX_ZERNIKE_ORDER,
            "zernike order {} exceeds the maximum of {MAX_ZERNIKE_ORDER}",
            self.n
        );
        let m = self.m.unsigned_abs();
        if m > self.n || (self.n - m) % 2 != 0 {
            bail!("invalid zernike index (n={}, m={})", self.n, self.m);
        }
        Ok(())
    }

    /// Radial polynomial `R_n^|m|(rho)`.
    fn radial(&self, rho: f64) -> f64 {
        let n = self.n as i64;
        let m = self.m.unsigned_abs() as i64;
        (0..=(n - m) / 2)
            .map(|k| {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                let num = factorial(n - k);
                let den = factorial(k) * factorial((n + m) / 2 - k) * factorial((n - m) / 2 - k);
                sign * num / den * rho.powi((n - 2 * k) as i32)
            })
            .sum()
    }

    /// Value on the unit disk at polar `(rho, theta)`.
    pub fn eval(&self, rho: f64, theta: f64) -> f64 {
        let r = self.radial(rho);
        let m = f64::from(self.m.unsigned_abs());
        if self.m >= 0 {
            r * (m * theta).cos()
        } else {
            r * (m * theta).sin()
        }
    }
}

fn factorial(k: i64) -> f64 {
    (1..=k).map(|i| i as f64).product()
}

/// Geometry needed to evaluate physical phase terms.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlmGeometry {
    /// Width in pixels.
    pub width: usize,
    /// Height in pixels.
    pub height: usize,
    /// Pixel pitch in micrometres.
    pub pixel_pitch_um: f64,
    /// Wavelength in micrometres.
    pub wavelength_um: f64,
}

/// Base plus additional phase for one modulator.
#[derive(Debug, Clone)]
pub struct PhaseManager {
    geometry: SlmGeometry,
    base: PhaseMap,
    base_source: String,
    additional: PhaseMap,
    add_log: Vec<PhaseTerm>,
}

impl PhaseManager {
    /// Zero base and additional phase.
    pub fn new(geometry: SlmGeometry) -> Self {
        Self {
            geometry,
            base: PhaseMap::zeros(geometry.width, geometry.height),
            base_source: String::new(),
            additional: PhaseMap::zeros(geometry.width, geometry.height),
            add_log: Vec::new(),
        }
    }

    /// Modulator geometry.
    pub fn geometry(&self) -> SlmGeometry {
        self.geometry
    }

    /// Replace the base phase. `source` names where it came from.
    pub fn set_base(&mut self, base: PhaseMap, source: impl Into<String>) -> Result<()> {
        ensure!(
            base.width() == self.geometry.width && base.height() == self.geometry.height,
            "pattern is {}x{}, SLM is {}x{}",
            base.width(),
            base.height(),
            self.geometry.width,
            self.geometry.height
        );
        self.base = base;
        self.base_source = source.into();
        Ok(())
    }

    /// Current base phase.
    pub fn base(&self) -> &PhaseMap {
        &self.base
    }

    /// Where the base phase came from, empty if none.
    pub fn base_source(&self) -> &str {
        &self.base_source
    }

    /// Back to a flat base.
    pub fn reset_base(&mut self) {
        self.base = PhaseMap::zeros(self.geometry.width, self.geometry.height);
        self.base_source.clear();
    }

    /// Drop every correction.
    pub fn reset_additional(&mut self) {
        self.additional = PhaseMap::zeros(self.geometry.width, self.geometry.height);
        self.add_log.clear();
    }

    /// Corrections added so far.
    pub fn add_log(&self) -> &[PhaseTerm] {
        &self.add_log
    }

    /// Accumulated correction phase.
    pub fn additional(&self) -> &PhaseMap {
        &self.additional
    }

    /// Add a thin lens `-π (x² + y²) / (λ f)`, centred on the modulator.
    pub fn add_fresnel_lens(&mut self, focal_length_mm: f64) -> Result<()> {
        ensure!(
            focal_length_mm.is_finite() && focal_length_mm != 0.0,
            "focal length must be finite and non-zero, got {focal_length_mm}"
        );
        let g = self.geometry;
        let focal_um = focal_length_mm * 1000.0;
        let cx = (g.width as f64 - 1.0) / 2.0;
        let cy = (g.height as f64 - 1.0) / 2.0;
        let lens = PhaseMap::from_fn(g.width, g.height, |x, y| {
            let dx = (x as f64 - cx) * g.pixel_pitch_um;
            let dy = (y as f64 - cy) * g.pixel_pitch_um;
            -PI * (dx * dx + dy * dy) / (g.wavelength_um * focal_um)
        });
        self.additional.add_assign(&lens)?;
        self.add_log.push(PhaseTerm::FresnelLens { focal_length_mm });
        Ok(())
    }

    /// Add a Zernike sum on the largest centred disk; zero outside it.
    pub fn add_zernike_poly(&mut self, terms: Vec<ZernikeTerm>) -> Result<()> {
        ensure!(!terms.is_empty(), "no zernike terms given");
        for term in &terms {
            term.check()?;
        }
        let g = self.geometry;
        let cx = (g.width as f64 - 1.0) / 2.0;
        let cy = (g.height as f64 - 1.0) / 2.0;
        let radius = (g.width.min(g.height) as f64 / 2.0).max(1.0);
        let sum = PhaseMap::from_fn(g.width, g.height, |x, y| {
            let dx = (x as f64 - cx) / radius;
            let dy = (y as f64 - cy) / radius;
            let rho = dx.hypot(dy);
            if rho > 1.0 {
                return 0.0;
            }
            let theta = dy.atan2(dx);
            terms.iter().map(|t| t.weight * t.eval(rho, theta)).sum()
        });
        self.additional.add_assign(&sum)?;
        self.add_log.push(PhaseTerm::Zernike(terms));
        Ok(())
    }

    /// `base + additional`, wrapped to `[0, 2π)`.
    pub fn combined(&self) -> PhaseMap {
        let mut total = self.base.clone();
        for (a, b) in total.data.iter_mut().zip(&self.additional.data) {
            *a += b;
        }
        total.wrapped()
    }

    /// Human-readable summary of the current phase.
    pub fn describe(&self) -> String {
        let base = if self.base_source.is_empty() {
            "none"
        } else {
            self.base_source.as_str()
        };
        let additional = if self.add_log.is_empty() {
            "none".to_string()
        } else {
            self.add_log
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" + ")
        };
        format!(
            "slm {}x{}; base: {base}; additional: {additional}",
            self.geometry.width, self.geometry.height
        )
    }
}
