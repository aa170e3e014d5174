//! Spot-array hologram solver.
//!
//! The servers only need `compute(targets, amps, iterations) -> phase`; this
//! module provides a weighted Gerchberg-Saxton implementation behind the
//! [`HologramSolver`] trait so a faster or vendor solver can be dropped in.
//!
//! Targets are far-field pixel offsets from the zero order in the
//! computational space. The modulator occupies the centre of that space and
//! is illuminated uniformly.

use std::f64::consts::TAU;
use std::sync::Arc;

use anyhow::{bail, ensure, Result};
use num_complex::Complex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use tracing::debug;

use crate::phase::PhaseMap;

/// Target spot positions, parsed from a `2 × N` array (all x, then all y).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpotTargets {
    xs: Vec<f64>,
    ys: Vec<f64>,
}

impl SpotTargets {
    /// Reshape a flat `[x0..xN, y0..yN]` array.
    pub fn from_flat(values: &[f64]) -> Result<Self> {
        if values.len() % 2 != 0 {
            bail!("not integer number of targets");
        }
        let n = values.len() / 2;
        Ok(Self {
            xs: values[..n].to_vec(),
            ys: values[n..].to_vec(),
        })
    }

    /// Number of spots.
    pub fn len(&self) -> usize {
        self.xs.len()
    }

    /// True if there are no spots.
    pub fn is_empty(&self) -> bool {
        self.xs.is_empty()
    }

    /// `(x, y)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.xs.iter().copied().zip(self.ys.iter().copied())
    }
}

/// Result of a calculation.
#[derive(Debug, Clone)]
pub struct Hologram {
    /// Modulator phase in `[0, 2π)`.
    pub phase: PhaseMap,
    /// Far-field amplitude at each target, normalized to the largest.
    pub spot_amplitudes: Vec<f64>,
    /// Fraction of far-field power landing on the targets.
    pub efficiency: f64,
    /// `1 - (max - min) / (max + min)` over target intensities.
    pub uniformity: f64,
    /// Iterations actually run.
    pub iterations: u32,
}

/// Opaque hologram calculation.
pub trait HologramSolver {
    /// Compute a phase that puts spots of relative amplitude `amps` at `targets`.
    fn compute(&mut self, targets: &SpotTargets, amps: &[f64], iterations: u32) -> Result<Hologram>;
}

/// 2D FFT over a row-major `width × height` buffer.
struct Fft2 {
    width: usize,
    height: usize,
    row_fwd: Arc<dyn Fft<f64>>,
    col_fwd: Arc<dyn Fft<f64>>,
    row_inv: Arc<dyn Fft<f64>>,
    col_inv: Arc<dyn Fft<f64>>,
    transposed: Vec<Complex<f64>>,
}

impl Fft2 {
    fn new(width: usize, height: usize) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            width,
            height,
            row_fwd: planner.plan_fft_forward(width),
            col_fwd: planner.plan_fft_forward(height),
            row_inv: planner.plan_fft_inverse(width),
            col_inv: planner.plan_fft_inverse(height),
            transposed: Vec::new(),
        }
    }

    fn forward(&mut self, data: &mut [Complex<f64>]) {
        let (row, col) = (self.row_fwd.clone(), self.col_fwd.clone());
        self.run(data, row.as_ref(), col.as_ref());
    }

    fn inverse(&mut self, data: &mut [Complex<f64>]) {
        let (row, col) = (self.row_inv.clone(), self.col_inv.clone());
        self.run(data, row.as_ref(), col.as_ref());
    }

    fn run(&mut self, data: &mut [Complex<f64>], row: &dyn Fft<f64>, col: &dyn Fft<f64>) {
        let (w, h) = (self.width, self.height);
        if self.transposed.len() != w * h {
            self.transposed.resize(w * h, Complex::new(0.0, 0.0));
        }
        // Rows are contiguous; rustfft processes every chunk of `w`.
        row.process(data);
        for y in 0..h {
            for x in 0..w {
                self.transposed[x * h + y] = data[y * w + x];
            }
        }
        col.process(&mut self.transposed);
        for x in 0..w {
            for y in 0..h {
                data[y * w + x] = self.transposed[x * h + y];
            }
        }
    }
}

/// Weighted Gerchberg-Saxton solver.
pub struct GerchbergSaxton {
    space: (usize, usize),
    slm: (usize, usize),
    rng: StdRng,
    fft: Fft2,
}

impl GerchbergSaxton {
    /// Solver over a `space` computational grid for a modulator of size `slm`.
    pub fn new(space: (usize, usize), slm: (usize, usize), seed: u64) -> Result<Self> {
        ensure!(
            space.0 >= slm.0 && space.1 >= slm.1 && slm.0 > 0 && slm.1 > 0,
            "computational space {}x{} cannot hold SLM {}x{}",
            space.0,
            space.1,
            slm.0,
            slm.1
        );
        Ok(Self {
            space,
            slm,
            rng: StdRng::seed_from_u64(seed),
            fft: Fft2::new(space.0, space.1),
        })
    }

    fn target_index(&self, x: f64, y: f64) -> Result<usize> {
        let (w, h) = self.space;
        let half_w = (w / 2) as f64;
        let half_h = (h / 2) as f64;
        ensure!(
            x.is_finite() && y.is_finite() && x.abs() < half_w && y.abs() < half_h,
            "target ({x}, {y}) is outside the {w}x{h} far field"
        );
        let ix = (x.round() as i64).rem_euclid(w as i64) as usize;
        let iy = (y.round() as i64).rem_euclid(h as i64) as usize;
        Ok(iy * w + ix)
    }

    fn slm_origin(&self) -> (usize, usize) {
        ((self.space.0 - self.slm.0) / 2, (self.space.1 - self.slm.1) / 2)
    }

    fn load_slm_field(&self, phase: &[f64], field: &mut [Complex<f64>]) {
        let (x0, y0) = self.slm_origin();
        field.fill(Complex::new(0.0, 0.0));
        for y in 0..self.slm.1 {
            for x in 0..self.slm.0 {
                field[(y0 + y) * self.space.0 + x0 + x] =
                    Complex::from_polar(1.0, phase[y * self.slm.0 + x]);
            }
        }
    }
}

impl HologramSolver for GerchbergSaxton {
    fn compute(&mut self, targets: &SpotTargets, amps: &[f64], iterations: u32) -> Result<Hologram> {
        ensure!(!targets.is_empty(), "no targets given");
        let amps: Vec<f64> = if amps.is_empty() {
            vec![1.0; targets.len()]
        } else {
            ensure!(
                amps.len() == targets.len(),
                "{} amplitudes for {} targets",
                amps.len(),
                targets.len()
            );
            ensure!(
                amps.iter().all(|a| a.is_finite() && *a > 0.0),
                "amplitudes must be positive"
            );
            amps.to_vec()
        };
        let indices = targets
            .iter()
            .map(|(x, y)| self.target_index(x, y))
            .collect::<Result<Vec<_>>>()?;

        let (sw, sh) = self.slm;
        let mut phase: Vec<f64> = (0..sw * sh).map(|_| self.rng.gen_range(0.0..TAU)).collect();
        let mut weights = vec![1.0; amps.len()];
        let mut field = vec![Complex::new(0.0, 0.0); self.space.0 * self.space.1];
        let (x0, y0) = self.slm_origin();

        for iteration in 0..iterations {
            self.load_slm_field(&phase, &mut field);
            self.fft.forward(&mut field);

            let measured: Vec<f64> = indices.iter().map(|&i| field[i].norm()).collect();
            let ratios: Vec<f64> = measured.iter().zip(&amps).map(|(m, a)| m / a).collect();
            let mean = ratios.iter().sum::<f64>() / ratios.len() as f64;
            for (w, r) in weights.iter_mut().zip(&ratios) {
                if *r > 0.0 {
                    *w *= mean / r;
                }
            }

            let spots: Vec<Complex<f64>> = indices
                .iter()
                .zip(weights.iter().zip(&amps))
                .map(|(&i, (w, a))| Complex::from_polar(w * a, field[i].arg()))
                .collect();
            field.fill(Complex::new(0.0, 0.0));
            for (&i, spot) in indices.iter().zip(spots) {
                field[i] += spot;
            }

            self.fft.inverse(&mut field);
            for y in 0..sh {
                for x in 0..sw {
                    phase[y * sw + x] = field[(y0 + y) * self.space.0 + x0 + x].arg();
                }
            }
            debug!(iteration, "Gerchberg-Saxton step");
        }

        self.load_slm_field(&phase, &mut field);
        self.fft.forward(&mut field);
        let total: f64 = field.iter().map(|c| c.norm_sqr()).sum();
        let intensities: Vec<f64> = indices.iter().map(|&i| field[i].norm_sqr()).collect();
        let on_target: f64 = intensities.iter().sum();
        let max = intensities.iter().copied().fold(0.0, f64::max);
        let min = intensities.iter().copied().fold(f64::INFINITY, f64::min);
        let uniformity = if max + min > 0.0 {
            1.0 - (max - min) / (max + min)
        } else {
            0.0
        };
        let peak = max.sqrt();
        let spot_amplitudes = intensities
            .iter()
            .map(|i| if peak > 0.0 { i.sqrt() / peak } else { 0.0 })
            .collect();

        Ok(Hologram {
            phase: PhaseMap::from_vec(sw, sh, phase)?.wrapped(),
            spot_amplitudes,
            efficiency: if total > 0.0 { on_target / total } else { 0.0 },
            uniformity,
            iterations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_targets_reshape_two_by_n() {
        let targets = SpotTargets::from_flat(&[1.0, 2.0, 3.0, 10.0, 20.0, 30.0]).unwrap();
        assert_eq!(targets.len(), 3);
        assert_eq!(
            targets.iter().collect::<Vec<_>>(),
            vec![(1.0, 10.0), (2.0, 20.0), (3.0, 30.0)]
        );
    }

    #[test]
    fn test_odd_target_array_is_rejected() {
        let err = SpotTargets::from_flat(&[1.0, 2.0, 3.0]).unwrap_err();
        assert_eq!(err.to_string(), "not integer number of targets");
    }

    #[test]
    fn test_fft_roundtrip_scales_by_size() {
        let mut fft = Fft2::new(4, 2);
        let original: Vec<Complex<f64>> = (0..8).map(|i| Complex::new(i as f64, 0.0)).collect();
        let mut data = original.clone();
        fft.forward(&mut data);
        // DC term is the sum of all samples.
        assert!((data[0].re - 28.0).abs() < 1e-9);
        fft.inverse(&mut data);
        for (a, b) in data.iter().zip(&original) {
            assert!((a.re / 8.0 - b.re).abs() < 1e-9);
        }
    }

    #[test]
    fn test_spots_concentrate_power() {
        let mut solver = GerchbergSaxton::new((32, 32), (16, 16), 7).unwrap();
        let targets = SpotTargets::from_flat(&[3.0, -4.0, 0.0, 5.0]).unwrap();
        let hologram = solver.compute(&targets, &[1.0, 1.0], 15).unwrap();

        assert_eq!(hologram.phase.width(), 16);
        assert_eq!(hologram.phase.height(), 16);
        assert!(hologram
            .phase
            .data()
            .iter()
            .all(|p| (0.0..TAU).contains(p)));
        // Uniform spreading would put 2/1024 of the power on two pixels.
        assert!(hologram.efficiency > 0.05, "efficiency {}", hologram.efficiency);
        assert_eq!(hologram.spot_amplitudes.len(), 2);
    }

    #[test]
    fn test_bad_inputs() {
        let mut solver = GerchbergSaxton::new((32, 32), (16, 16), 0).unwrap();
        let targets = SpotTargets::from_flat(&[3.0, 0.0]).unwrap();
        assert!(solver.compute(&targets, &[1.0, 2.0], 1).is_err());
        let far = SpotTargets::from_flat(&[40.0, 0.0]).unwrap();
        assert!(solver.compute(&far, &[], 1).is_err());
        assert!(GerchbergSaxton::new((8, 8), (16, 16), 0).is_err());
    }
}
