//! Pattern server: hologram calculation and phase corrections for the SLM,
//! plus camera passthrough so one endpoint can run a whole feedback cycle.
//!
//! `calculate` replaces the base phase but does not touch the modulator;
//! `project` writes base plus additional phase. `use_pattern` loads and
//! projects in one step.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use tracing::{debug, info};

use crate::catalog::{CatalogError, CommandCatalog};
use crate::config::ServerConfig;
use crate::hardware::{Camera, Slm, VirtualSlm};
use crate::hologram::{GerchbergSaxton, HologramSolver, SpotTargets};
use crate::pattern_store::{self, Calculation};
use crate::phase::{PhaseManager, SlmGeometry, ZernikeTerm};
use crate::protocol::{ArgKind, Frame, Reply};

use super::open_camera;

/// State owned by the pattern worker.
pub struct PatternContext {
    name: String,
    slm: Box<dyn Slm>,
    camera: Box<dyn Camera>,
    phase: PhaseManager,
    solver: Box<dyn HologramSolver>,
    last: Option<Calculation>,
    pattern_path: PathBuf,
    n_iterations: u8,
    computational_space: [usize; 2],
}

impl PatternContext {
    /// Open the configured modulator and camera and plan the solver.
    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        let slm_cfg = &config.slm;
        let slm = VirtualSlm::new(slm_cfg.width, slm_cfg.height, slm_cfg.bitdepth)
            .with_optics(slm_cfg.pixel_pitch_um, slm_cfg.wav_um);
        let camera = open_camera(&config.camera)?;
        let space = config.alg.computational_space;
        let solver = GerchbergSaxton::new(
            (space[0], space[1]),
            (slm_cfg.width as usize, slm_cfg.height as usize),
            config.alg.seed,
        )?;
        info!(
            server = %config.name,
            slm = %slm.describe(),
            space = ?space,
            "Pattern server ready"
        );
        Ok(Self::new(
            &config.name,
            Box::new(slm),
            camera,
            Box::new(solver),
            config.pattern_path.clone(),
            config.alg.n_iterations,
            space,
        ))
    }

    /// Assemble a context from already-opened parts.
    pub fn new(
        name: &str,
        slm: Box<dyn Slm>,
        camera: Box<dyn Camera>,
        solver: Box<dyn HologramSolver>,
        pattern_path: PathBuf,
        n_iterations: u8,
        computational_space: [usize; 2],
    ) -> Self {
        let phase = PhaseManager::new(SlmGeometry {
            width: slm.width() as usize,
            height: slm.height() as usize,
            pixel_pitch_um: slm.pixel_pitch_um(),
            wavelength_um: slm.wavelength_um(),
        });
        Self {
            name: name.to_string(),
            slm,
            camera,
            phase,
            solver,
            last: None,
            pattern_path,
            n_iterations,
            computational_space,
        }
    }

    /// Current phase bookkeeping.
    pub fn phase(&self) -> &PhaseManager {
        &self.phase
    }

    fn project(&mut self) -> Result<()> {
        let combined = self.phase.combined();
        self.slm.display(&combined)?;
        debug!(server = %self.name, phase = %self.phase.describe(), "Projected");
        Ok(())
    }

    fn use_pattern(&mut self, path: &str) -> Result<()> {
        let phase = pattern_store::load_pattern(&self.pattern_path, path)?;
        self.phase.set_base(phase, path)?;
        info!(server = %self.name, pattern = %path, "Using saved pattern");
        self.project()
    }

    fn calculate(&mut self, targets: &[f64], amps: &[f64], iterations: u8) -> Result<()> {
        let targets = SpotTargets::from_flat(targets)?;
        let iterations = if iterations == 0 {
            self.n_iterations
        } else {
            iterations
        };
        let hologram = self
            .solver
            .compute(&targets, amps, u32::from(iterations))?;
        info!(
            server = %self.name,
            spots = targets.len(),
            iterations,
            efficiency = hologram.efficiency,
            uniformity = hologram.uniformity,
            "Hologram calculated"
        );
        self.phase.set_base(
            hologram.phase.clone(),
            format!("calculation of {} spots", targets.len()),
        )?;
        self.last = Some(Calculation {
            targets,
            amps: amps.to_vec(),
            computational_space: self.computational_space,
            hologram,
        });
        Ok(())
    }

    fn save_calculation(&self, path: &str, name: &str) -> Result<(String, String)> {
        let calculation = self
            .last
            .as_ref()
            .context("no calculation to save")?;
        let dir = if path.is_empty() {
            self.pattern_path.clone()
        } else {
            PathBuf::from(path)
        };
        let (config, pattern) = pattern_store::save_calculation(&dir, name, calculation)?;
        Ok((
            config.display().to_string(),
            pattern.display().to_string(),
        ))
    }
}

fn dimension(value: u32) -> Result<Reply> {
    Ok(Reply::i32(i32::try_from(value)?))
}

/// Commands of the pattern server.
pub fn catalog() -> Result<CommandCatalog<PatternContext>, CatalogError> {
    let mut catalog = CommandCatalog::new();
    catalog
        .register_sync("id", &[], |ctx: &mut PatternContext, _| {
            Ok(Reply::text(format!(
                "{}: pattern server, {}",
                ctx.name,
                ctx.slm.describe()
            )))
        })?
        .register_sync("use_pattern", &[ArgKind::Text], |ctx: &mut PatternContext, args| {
            ctx.use_pattern(args.text(0)?)?;
            Ok(Reply::ok())
        })?
        .register_sync(
            "calculate",
            &[ArgKind::F64Array, ArgKind::F64Array, ArgKind::U8],
            |ctx: &mut PatternContext, args| {
                ctx.calculate(args.f64_array(0)?, args.f64_array(1)?, args.u8(2)?)?;
                Ok(Reply::ok())
            },
        )?
        .register_sync(
            "save_calculation",
            &[ArgKind::Text, ArgKind::Text],
            |ctx: &mut PatternContext, args| {
                let (config, pattern) = ctx.save_calculation(args.text(0)?, args.text(1)?)?;
                Ok(Reply::text(config).with(Frame::text(pattern)))
            },
        )?
        .register_sync("add_fresnel_lens", &[ArgKind::F64], |ctx: &mut PatternContext, args| {
            ctx.phase.add_fresnel_lens(args.f64(0)?)?;
            Ok(Reply::ok())
        })?
        .register_sync(
            "add_zernike_poly",
            &[ArgKind::F64Array],
            |ctx: &mut PatternContext, args| {
                let terms = ZernikeTerm::from_triples(args.f64_array(0)?)?;
                ctx.phase.add_zernike_poly(terms)?;
                Ok(Reply::ok())
            },
        )?
        .register_sync("reset_additional_phase", &[], |ctx: &mut PatternContext, _| {
            ctx.phase.reset_additional();
            Ok(Reply::ok())
        })?
        .register_sync("reset_pattern", &[], |ctx: &mut PatternContext, _| {
            ctx.phase.reset_base();
            Ok(Reply::ok())
        })?
        .register_sync("project", &[], |ctx: &mut PatternContext, _| {
            ctx.project()?;
            Ok(Reply::ok())
        })?
        .register_sync("get_current_phase_info", &[], |ctx: &mut PatternContext, _| {
            Ok(Reply::text(ctx.phase.describe()))
        })?
        .register_sync("get_slm_shape", &[], |ctx: &mut PatternContext, _| {
            Ok(dimension(ctx.slm.width())?.with(Frame::i32(i32::try_from(ctx.slm.height())?)))
        })?
        // Camera passthrough.
        .register_sync("get_width", &[], |ctx: &mut PatternContext, _| {
            dimension(ctx.camera.width()?)
        })?
        .register_sync("get_height", &[], |ctx: &mut PatternContext, _| {
            dimension(ctx.camera.height()?)
        })?
        .register_sync("get_depth", &[], |ctx: &mut PatternContext, _| {
            dimension(ctx.camera.depth()?)
        })?
        .register_sync("get_exposure", &[], |ctx: &mut PatternContext, _| {
            Ok(Reply::f64(ctx.camera.exposure()?))
        })?
        .register_sync("set_exposure", &[ArgKind::F64], |ctx: &mut PatternContext, args| {
            ctx.camera.set_exposure(args.f64(0)?)?;
            Ok(Reply::ok())
        })?
        .register_sync("get_image", &[], |ctx: &mut PatternContext, _| {
            Ok(Reply::binary(ctx.camera.capture()?.to_bytes()))
        })?;
    Ok(catalog)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_i32, encode_f64_array};
    use crate::servers::tests::{invoke, text};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.name = "pat".to_string();
        config.url = Some("tcp://127.0.0.1:*".to_string());
        config.pattern_path = dir.path().to_path_buf();
        config.slm.width = 16;
        config.slm.height = 16;
        config.alg.computational_space = [32, 32];
        config.alg.n_iterations = 5;
        config.camera.width = 8;
        config.camera.height = 4;
        config
    }

    fn calculate_frames() -> Vec<Frame> {
        vec![
            Frame::binary(encode_f64_array(&[3.0, -2.0, 1.0, 4.0])),
            Frame::binary(encode_f64_array(&[1.0, 1.0])),
            Frame::binary(vec![0]),
        ]
    }

    #[test]
    fn test_odd_targets_are_rejected() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog().unwrap();
        let mut ctx = PatternContext::from_config(&config(&dir)).unwrap();
        let err = invoke(
            &catalog,
            &mut ctx,
            "calculate",
            &[
                Frame::f64_array(&[1.0, 2.0, 3.0]),
                Frame::f64_array(&[]),
                Frame::binary(vec![1]),
            ],
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "not integer number of targets");
    }

    #[test]
    fn test_calculate_save_and_reuse() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog().unwrap();
        let mut ctx = PatternContext::from_config(&config(&dir)).unwrap();

        // Nothing to save yet.
        assert!(invoke(
            &catalog,
            &mut ctx,
            "save_calculation",
            &[Frame::text(""), Frame::text("first")]
        )
        .is_err());

        let reply = invoke(&catalog, &mut ctx, "calculate", &calculate_frames()).unwrap();
        assert_eq!(text(&reply), "ok");
        assert!(ctx.phase().base_source().starts_with("calculation of 2 spots"));

        let reply = invoke(
            &catalog,
            &mut ctx,
            "save_calculation",
            &[Frame::text(""), Frame::text("first")],
        )
        .unwrap();
        assert_eq!(reply.frames().len(), 2);
        let pattern = reply.frames()[1].as_text().unwrap().to_string();
        assert!(pattern.ends_with("first_pattern.bin"));
        assert!(reply.frames()[0]
            .as_text()
            .unwrap()
            .ends_with("first_config.json"));

        invoke(&catalog, &mut ctx, "reset_pattern", &[]).unwrap();
        let reply = invoke(
            &catalog,
            &mut ctx,
            "use_pattern",
            &[Frame::text("first_pattern.bin")],
        )
        .unwrap();
        assert_eq!(text(&reply), "ok");
        assert_eq!(ctx.phase().base_source(), "first_pattern.bin");
    }

    #[test]
    fn test_missing_pattern_is_an_error() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog().unwrap();
        let mut ctx = PatternContext::from_config(&config(&dir)).unwrap();
        assert!(invoke(&catalog, &mut ctx, "use_pattern", &[Frame::text("nope.bin")]).is_err());
    }

    #[test]
    fn test_corrections_show_in_phase_info() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog().unwrap();
        let mut ctx = PatternContext::from_config(&config(&dir)).unwrap();

        invoke(&catalog, &mut ctx, "add_fresnel_lens", &[Frame::f64(100.0)]).unwrap();
        invoke(
            &catalog,
            &mut ctx,
            "add_zernike_poly",
            &[Frame::f64_array(&[2.0, 0.0, 0.5])],
        )
        .unwrap();
        let info = invoke(&catalog, &mut ctx, "get_current_phase_info", &[]).unwrap();
        assert_eq!(
            text(&info),
            "slm 16x16; base: none; additional: fresnel_lens(100 mm) + zernike[(2, 0, 0.5)]"
        );
        assert_eq!(text(&invoke(&catalog, &mut ctx, "project", &[]).unwrap()), "ok");

        invoke(&catalog, &mut ctx, "reset_additional_phase", &[]).unwrap();
        let info = invoke(&catalog, &mut ctx, "get_current_phase_info", &[]).unwrap();
        assert_eq!(text(&info), "slm 16x16; base: none; additional: none");
    }

    #[test]
    fn test_invalid_zernike_is_an_error() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog().unwrap();
        let mut ctx = PatternContext::from_config(&config(&dir)).unwrap();
        // n - |m| odd.
        assert!(invoke(
            &catalog,
            &mut ctx,
            "add_zernike_poly",
            &[Frame::f64_array(&[2.0, 1.0, 0.5])]
        )
        .is_err());
    }

    #[test]
    fn test_shapes() {
        let dir = TempDir::new().unwrap();
        let catalog = catalog().unwrap();
        let mut ctx = PatternContext::from_config(&config(&dir)).unwrap();

        let slm = invoke(&catalog, &mut ctx, "get_slm_shape", &[]).unwrap();
        assert_eq!(decode_i32(&slm.frames()[0].bytes).unwrap(), 16);
        assert_eq!(decode_i32(&slm.frames()[1].bytes).unwrap(), 16);

        let width = invoke(&catalog, &mut ctx, "get_width", &[]).unwrap();
        assert_eq!(decode_i32(&width.frames()[0].bytes).unwrap(), 8);
        let image = invoke(&catalog, &mut ctx, "get_image", &[]).unwrap();
        assert_eq!(image.frames()[0].bytes.len(), 8 * 4);
    }
}
