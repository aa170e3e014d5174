//! Server configuration using Figment.
//!
//! A server is configured from one file, YAML or TOML chosen by extension,
//! with `SLMD_`-prefixed environment variables layered on top. Nested keys
//! are separated by a double underscore:
//!
//! ```text
//! SLMD_URL=tcp://127.0.0.1:5555
//! SLMD_WORKER__DEBUG_FAIL_LOUD=true
//! SLMD_CAMERA__EXPOSURE_S=0.05
//! ```
//!
//! The endpoint `url` has no default. A config without it fails validation
//! and the server refuses to start.
//!
//! # Example
//!
//! ```no_run
//! use slm_daq::config::ServerConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::load_from("config/pattern.yaml")?;
//!     println!("Serving {:?} on {}", config.role, config.endpoint_url()?);
//!     Ok(())
//! }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::worker::WorkerConfig;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SLMD_";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be parsed or merged.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// Values are present but unusable.
    #[error("Configuration validation error: {0}")]
    Validation(String),
    /// Config file does not exist.
    #[error("Configuration file not found: {0}")]
    Missing(PathBuf),
}

/// Which catalog a process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    /// SLM pattern server (hologram calculation, phase corrections, camera passthrough).
    #[default]
    Pattern,
    /// Stand-alone camera server.
    Camera,
    /// Imaging-detector server whose answers come from an external program.
    Feedback,
}

/// Top-level server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Endpoint to bind, e.g. `tcp://*:5555`. Required.
    #[serde(default)]
    pub url: Option<String>,
    /// Catalog to serve.
    #[serde(default)]
    pub role: ServerRole,
    /// Server name, reported by `id` and used as the worker thread name.
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Worker loop tunables.
    #[serde(default)]
    pub worker: WorkerSettings,
    /// Deferred reply mailbox.
    #[serde(default)]
    pub mailbox: MailboxSettings,
    /// Directory for saved and loaded patterns.
    #[serde(default = "default_pattern_path")]
    pub pattern_path: PathBuf,
    /// Hologram algorithm settings.
    #[serde(default)]
    pub alg: AlgorithmConfig,
    /// Phase modulator settings.
    #[serde(default)]
    pub slm: SlmConfig,
    /// Camera settings.
    #[serde(default)]
    pub camera: CameraConfig,
}

/// Worker loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSettings {
    /// Poll timeout while idle, in milliseconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// Poll timeout while a deferred request is parked, in milliseconds
    #[serde(default = "default_completion_check")]
    pub completion_check_ms: u64,
    /// End the worker on the first handler error
    #[serde(default)]
    pub debug_fail_loud: bool,
}

/// Mailbox flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MailboxKind {
    /// Completed from inside the process.
    #[default]
    Memory,
    /// Completed by another process through a JSON file.
    File,
}

/// Deferred reply mailbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxSettings {
    /// Memory or file
    #[serde(default)]
    pub kind: MailboxKind,
    /// Exchange file, required for the file mailbox
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Minimum time between file reads, in milliseconds
    #[serde(default = "default_mailbox_poll")]
    pub poll_interval_ms: u64,
}

/// Hologram algorithm configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    /// FFT grid used by the solver, `[width, height]`
    #[serde(default = "default_computational_space")]
    pub computational_space: [usize; 2],
    /// Iterations used when a request asks for 0
    #[serde(default = "default_iterations")]
    pub n_iterations: u8,
    /// Seed of the initial random phase
    #[serde(default)]
    pub seed: u64,
}

/// Phase modulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlmConfig {
    /// Only "virtual" is built in
    #[serde(default = "default_slm_type")]
    pub r#type: String,
    /// Width in pixels
    #[serde(default = "default_slm_width")]
    pub width: u32,
    /// Height in pixels
    #[serde(default = "default_slm_height")]
    pub height: u32,
    /// Bit depth of the phase levels
    #[serde(default = "default_bitdepth")]
    pub bitdepth: u32,
    /// Wavelength in micrometres
    #[serde(default = "default_wavelength")]
    pub wav_um: f64,
    /// Pixel pitch in micrometres
    #[serde(default = "default_pixel_pitch")]
    pub pixel_pitch_um: f64,
}

/// Camera backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CameraKind {
    /// Simulated camera in-process.
    #[default]
    Virtual,
    /// Remote camera server reached over the network.
    Network,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Virtual or network
    #[serde(default)]
    pub r#type: CameraKind,
    /// Camera server endpoint, required for the network camera
    #[serde(default)]
    pub url: Option<String>,
    /// Width in pixels
    #[serde(default = "default_camera_side")]
    pub width: u32,
    /// Height in pixels
    #[serde(default = "default_camera_side")]
    pub height: u32,
    /// Bit depth of a pixel
    #[serde(default = "default_bitdepth")]
    pub bitdepth: u32,
    /// Initial exposure in seconds
    #[serde(default = "default_exposure")]
    pub exposure_s: f64,
    /// Per-frame reply timeout of the network camera, in milliseconds
    #[serde(default = "default_camera_timeout")]
    pub timeout_ms: u64,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_name() -> String {
    "slmd".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_poll_timeout() -> u64 {
    500
}

fn default_completion_check() -> u64 {
    20
}

fn default_mailbox_poll() -> u64 {
    200
}

fn default_pattern_path() -> PathBuf {
    PathBuf::from("patterns")
}

fn default_computational_space() -> [usize; 2] {
    [2048, 2048]
}

fn default_iterations() -> u8 {
    20
}

fn default_slm_type() -> String {
    "virtual".to_string()
}

fn default_slm_width() -> u32 {
    1272
}

fn default_slm_height() -> u32 {
    1024
}

fn default_bitdepth() -> u32 {
    8
}

fn default_wavelength() -> f64 {
    1.064
}

fn default_pixel_pitch() -> f64 {
    12.5
}

fn default_camera_side() -> u32 {
    1024
}

fn default_exposure() -> f64 {
    0.1
}

fn default_camera_timeout() -> u64 {
    1000
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            completion_check_ms: default_completion_check(),
            debug_fail_loud: false,
        }
    }
}

impl Default for MailboxSettings {
    fn default() -> Self {
        Self {
            kind: MailboxKind::Memory,
            path: None,
            poll_interval_ms: default_mailbox_poll(),
        }
    }
}

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            computational_space: default_computational_space(),
            n_iterations: default_iterations(),
            seed: 0,
        }
    }
}

impl Default for SlmConfig {
    fn default() -> Self {
        Self {
            r#type: default_slm_type(),
            width: default_slm_width(),
            height: default_slm_height(),
            bitdepth: default_bitdepth(),
            wav_um: default_wavelength(),
            pixel_pitch_um: default_pixel_pitch(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            r#type: CameraKind::Virtual,
            url: None,
            width: default_camera_side(),
            height: default_camera_side(),
            bitdepth: default_bitdepth(),
            exposure_s: default_exposure(),
            timeout_ms: default_camera_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            role: ServerRole::default(),
            name: default_name(),
            log_level: default_log_level(),
            worker: WorkerSettings::default(),
            mailbox: MailboxSettings::default(),
            pattern_path: default_pattern_path(),
            alg: AlgorithmConfig::default(),
            slm: SlmConfig::default(),
            camera: CameraConfig::default(),
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl ServerConfig {
    /// Load configuration from a file and `SLMD_` environment variables
    ///
    /// Files ending in `.yaml` or `.yml` are read as YAML, anything else as
    /// TOML. Environment variables take precedence over the file.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if:
    /// - The file does not exist
    /// - The file cannot be parsed
    /// - Validation fails
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }
        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let figment = if is_yaml {
            Figment::new().merge(Yaml::file(path))
        } else {
            Figment::new().merge(Toml::file(path))
        };
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - `url` is present and non-empty
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Poll timeouts are non-zero
    /// - The file mailbox has a path
    /// - SLM and camera dimensions and bit depths are positive
    /// - A network camera has a url, and only the pattern role uses one
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.endpoint_url()?;

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.worker.poll_timeout_ms == 0 || self.worker.completion_check_ms == 0 {
            return Err(ConfigError::Validation(
                "worker poll timeouts must be greater than 0".to_string(),
            ));
        }

        if self.mailbox.kind == MailboxKind::File && self.mailbox.path.is_none() {
            return Err(ConfigError::Validation(
                "mailbox.kind = \"file\" requires mailbox.path".to_string(),
            ));
        }

        if self.slm.r#type != "virtual" {
            return Err(ConfigError::Validation(format!(
                "Unsupported slm type '{}'. Must be: virtual",
                self.slm.r#type
            )));
        }
        if self.slm.width == 0 || self.slm.height == 0 || self.slm.bitdepth == 0 {
            return Err(ConfigError::Validation(
                "slm width, height and bitdepth must be positive".to_string(),
            ));
        }
        if self.slm.wav_um <= 0.0 || self.slm.pixel_pitch_um <= 0.0 {
            return Err(ConfigError::Validation(
                "slm wav_um and pixel_pitch_um must be positive".to_string(),
            ));
        }

        let [cw, ch] = self.alg.computational_space;
        if cw < self.slm.width as usize || ch < self.slm.height as usize {
            return Err(ConfigError::Validation(format!(
                "alg.computational_space {cw}x{ch} is smaller than the SLM {}x{}",
                self.slm.width, self.slm.height
            )));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Validation(
                "camera width and height must be positive".to_string(),
            ));
        }
        if !(1..=16).contains(&self.camera.bitdepth) {
            return Err(ConfigError::Validation(format!(
                "Invalid camera bitdepth {}. Must be 1-16",
                self.camera.bitdepth
            )));
        }
        if self.camera.r#type == CameraKind::Network {
            if self.role != ServerRole::Pattern {
                return Err(ConfigError::Validation(
                    "a network camera is only supported by the pattern role".to_string(),
                ));
            }
            if self.camera.url.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Validation(
                    "camera.type = \"network\" requires camera.url".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// The endpoint url, or a validation error if it is missing.
    pub fn endpoint_url(&self) -> Result<&str, ConfigError> {
        match self.url.as_deref() {
            Some(url) if !url.trim().is_empty() => Ok(url),
            _ => Err(ConfigError::Validation(
                "'url' is required; the server will not start without an endpoint".to_string(),
            )),
        }
    }

    /// Worker loop settings in runtime form.
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            name: self.name.clone(),
            poll_timeout: Duration::from_millis(self.worker.poll_timeout_ms),
            completion_check: Duration::from_millis(self.worker.completion_check_ms),
            fail_loud: self.worker.debug_fail_loud,
        }
    }
}
