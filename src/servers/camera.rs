//! Camera server: a [`Camera`] exposed one command per method.

use anyhow::Result;
use tracing::info;

use crate::catalog::{CatalogError, CommandCatalog};
use crate::hardware::Camera;
use crate::protocol::{ArgKind, Reply};

/// State owned by the camera worker.
pub struct CameraContext {
    name: String,
    camera: Box<dyn Camera>,
}

impl CameraContext {
    /// Serve `camera` under `name`.
    pub fn new(name: &str, camera: Box<dyn Camera>) -> Self {
        Self {
            name: name.to_string(),
            camera,
        }
    }

    fn id(&mut self) -> Result<String> {
        Ok(format!(
            "{}: camera server, serial {}",
            self.name,
            self.camera.serial()?
        ))
    }
}

fn dimension(value: u32) -> Result<Reply> {
    Ok(Reply::i32(i32::try_from(value)?))
}

/// Commands of the camera server.
pub fn catalog() -> Result<CommandCatalog<CameraContext>, CatalogError> {
    let mut catalog = CommandCatalog::new();
    catalog
        .register_sync("id", &[], |ctx: &mut CameraContext, _| {
            Ok(Reply::text(ctx.id()?))
        })?
        .register_sync("get_serial", &[], |ctx: &mut CameraContext, _| {
            Ok(Reply::text(ctx.camera.serial()?))
        })?
        .register_sync("info", &[], |ctx: &mut CameraContext, _| {
            Ok(Reply::text(ctx.camera.info()?))
        })?
        .register_sync("get_width", &[], |ctx: &mut CameraContext, _| {
            dimension(ctx.camera.width()?)
        })?
        .register_sync("get_height", &[], |ctx: &mut CameraContext, _| {
            dimension(ctx.camera.height()?)
        })?
        .register_sync("get_depth", &[], |ctx: &mut CameraContext, _| {
            dimension(ctx.camera.depth()?)
        })?
        .register_sync("get_exposure", &[], |ctx: &mut CameraContext, _| {
            Ok(Reply::f64(ctx.camera.exposure()?))
        })?
        .register_sync("set_exposure", &[ArgKind::F64], |ctx: &mut CameraContext, args| {
            let seconds = args.f64(0)?;
            ctx.camera.set_exposure(seconds)?;
            info!(camera = %ctx.name, seconds, "Exposure set");
            Ok(Reply::ok())
        })?
        .register_sync("set_woi", &[ArgKind::F64Array], |ctx: &mut CameraContext, args| {
            ctx.camera.set_woi(args.f64_array(0)?)?;
            Ok(Reply::ok())
        })?
        .register_sync("get_image", &[], |ctx: &mut CameraContext, _| {
            Ok(Reply::binary(ctx.camera.capture()?.to_bytes()))
        })?
        .register_sync("flush", &[], |ctx: &mut CameraContext, _| {
            ctx.camera.flush()?;
            Ok(Reply::ok())
        })?
        .register_sync("close", &[], |ctx: &mut CameraContext, _| {
            ctx.camera.close()?;
            info!(camera = %ctx.name, "Camera closed");
            Ok(Reply::ok())
        })?;
    Ok(catalog)
}
