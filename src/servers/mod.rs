//! Device server roles.
//!
//! Each role supplies a [`CommandCatalog`] and the context its handlers run
//! against; [`launch`] wires one of them to a bound transport and a mailbox
//! according to a [`ServerConfig`].

pub mod camera;
pub mod feedback;
pub mod pattern;

pub use camera::CameraContext;
pub use feedback::FeedbackContext;
pub use pattern::PatternContext;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tracing::info;

use crate::client::{CameraClient, Timeout};
use crate::config::{CameraConfig, CameraKind, ConfigError, MailboxKind, ServerConfig, ServerRole};
use crate::error::AppResult;
use crate::hardware::{Camera, VirtualCamera};
use crate::mailbox::{DeferredMailbox, FileMailbox, SharedMailbox};
use crate::server::ServerHandle;
use crate::transport::ZmqRouter;

/// Bind the configured endpoint and start the configured role.
pub fn launch(config: &ServerConfig) -> AppResult<ServerHandle> {
    config.validate()?;
    let url = config.endpoint_url()?;
    let transport = ZmqRouter::bind(url)?;
    let mailbox = build_mailbox(config)?;
    let worker = config.worker_config();
    info!(server = %config.name, role = ?config.role, %url, "Launching server");

    let cfg = config.clone();
    match config.role {
        ServerRole::Pattern => ServerHandle::spawn(
            transport,
            pattern::catalog()?,
            move || PatternContext::from_config(&cfg),
            mailbox,
            worker,
        ),
        ServerRole::Camera => ServerHandle::spawn(
            transport,
            camera::catalog()?,
            move || Ok(CameraContext::new(&cfg.name, open_camera(&cfg.camera)?)),
            mailbox,
            worker,
        ),
        ServerRole::Feedback => ServerHandle::spawn(
            transport,
            feedback::catalog()?,
            move || Ok(FeedbackContext::new(&cfg.name)),
            mailbox,
            worker,
        ),
    }
}

fn build_mailbox(config: &ServerConfig) -> AppResult<Arc<dyn DeferredMailbox>> {
    Ok(match config.mailbox.kind {
        MailboxKind::Memory => Arc::new(SharedMailbox::new()),
        MailboxKind::File => {
            let path = config.mailbox.path.clone().ok_or_else(|| {
                ConfigError::Validation("mailbox.kind = \"file\" requires mailbox.path".to_string())
            })?;
            Arc::new(FileMailbox::new(
                path,
                Duration::from_millis(config.mailbox.poll_interval_ms),
            )?)
        }
    })
}

/// Open the configured camera backend.
pub(crate) fn open_camera(config: &CameraConfig) -> anyhow::Result<Box<dyn Camera>> {
    match config.r#type {
        CameraKind::Virtual => Ok(Box::new(
            VirtualCamera::new(config.width, config.height, config.bitdepth)
                .with_exposure(config.exposure_s),
        )),
        CameraKind::Network => {
            let url = config
                .url
                .as_deref()
                .context("network camera needs camera.url")?;
            let mut camera = CameraClient::connect(url, Timeout::Millis(config.timeout_ms))?;
            let serial = camera
                .serial()
                .with_context(|| format!("camera server at {url} did not answer"))?;
            info!(%url, %serial, "Connected to camera server");
            Ok(Box::new(camera))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::catalog::{CommandCatalog, CommandMode};
    use crate::protocol::{Frame, Reply};

    /// Run a registered inline command directly against `context`.
    pub(crate) fn invoke<C>(
        catalog: &CommandCatalog<C>,
        context: &mut C,
        command: &str,
        args: &[Frame],
    ) -> anyhow::Result<Reply> {
        let descriptor = catalog
            .get(command)
            .ok_or_else(|| anyhow::anyhow!("no command {command}"))?;
        let frames: Vec<Vec<u8>> = args.iter().map(|f| f.bytes.clone()).collect();
        let args = descriptor.decode_args(&frames)?;
        match descriptor.mode() {
            CommandMode::Sync(handler) => handler(context, &args),
            CommandMode::Deferred(_) => anyhow::bail!("{command} is deferred"),
        }
    }

    /// First frame as text.
    pub(crate) fn text(reply: &Reply) -> &str {
        reply.frames()[0].as_text().unwrap_or("<binary>")
    }
}
