//! Saved calculations.
//!
//! `save_calculation` writes two files next to each other:
//! - `<name>_config.json`: the inputs and quality figures of the run
//! - `<name>_pattern.bin`: the modulator phase, bincode-encoded
//!
//! `use_pattern` loads a `.bin` file back as the base phase.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::hologram::{Hologram, SpotTargets};
use crate::phase::PhaseMap;

/// JSON side-car describing a saved calculation.
#[derive(Debug, Clone, Serialize)]
pub struct CalculationRecord {
    /// Save name.
    pub name: String,
    /// When it was written.
    pub saved_at: DateTime<Utc>,
    /// FFT grid of the solver.
    pub computational_space: [usize; 2],
    /// SLM `[width, height]`.
    pub slm_shape: [usize; 2],
    /// Iterations run.
    pub n_iterations: u32,
    /// Spot positions.
    pub targets: SpotTargets,
    /// Requested relative amplitudes.
    pub amps: Vec<f64>,
    /// Achieved relative amplitudes.
    pub spot_amplitudes: Vec<f64>,
    /// Fraction of power on target.
    pub efficiency: f64,
    /// Spot intensity uniformity.
    pub uniformity: f64,
}

/// The last calculation, kept by the pattern server until it is saved.
#[derive(Debug, Clone)]
pub struct Calculation {
    /// Spot positions.
    pub targets: SpotTargets,
    /// Requested amplitudes.
    pub amps: Vec<f64>,
    /// FFT grid.
    pub computational_space: [usize; 2],
    /// Solver output.
    pub hologram: Hologram,
}

#[derive(Serialize, Deserialize)]
struct PatternFile {
    version: u32,
    phase: PhaseMap,
}

const PATTERN_VERSION: u32 = 1;

/// Write `<dir>/<name>_config.json` and `<dir>/<name>_pattern.bin`.
///
/// Returns the two paths in that order.
pub fn save_calculation(dir: &Path, name: &str, calc: &Calculation) -> Result<(PathBuf, PathBuf)> {
    anyhow::ensure!(!name.is_empty(), "save name must not be empty");
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let record = CalculationRecord {
        name: name.to_string(),
        saved_at: Utc::now(),
        computational_space: calc.computational_space,
        slm_shape: [calc.hologram.phase.width(), calc.hologram.phase.height()],
        n_iterations: calc.hologram.iterations,
        targets: calc.targets.clone(),
        amps: calc.amps.clone(),
        spot_amplitudes: calc.hologram.spot_amplitudes.clone(),
        efficiency: calc.hologram.efficiency,
        uniformity: calc.hologram.uniformity,
    };
    let config_path = dir.join(format!("{name}_config.json"));
    let json = serde_json::to_string_pretty(&record)?;
    fs::write(&config_path, json).with_context(|| format!("writing {}", config_path.display()))?;

    let pattern_path = dir.join(format!("{name}_pattern.bin"));
    let encoded = bincode::serialize(&PatternFile {
        version: PATTERN_VERSION,
        phase: calc.hologram.phase.clone(),
    })?;
    fs::write(&pattern_path, encoded)
        .with_context(|| format!("writing {}", pattern_path.display()))?;

    info!(config = %config_path.display(), pattern = %pattern_path.display(), "Saved calculation");
    Ok((config_path, pattern_path))
}

/// Load a saved phase. Relative paths resolve against `pattern_dir`.
pub fn load_pattern(pattern_dir: &Path, path: &str) -> Result<PhaseMap> {
    let full = pattern_dir.join(path);
    let bytes = fs::read(&full).with_context(|| format!("reading {}", full.display()))?;
    let file: PatternFile = bincode::deserialize(&bytes)
        .with_context(|| format!("{} is not a saved pattern", full.display()))?;
    anyhow::ensure!(
        file.version == PATTERN_VERSION,
        "unsupported pattern version {}",
        file.version
    );
    Ok(file.phase)
}
