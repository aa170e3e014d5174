//! Server lifecycle: one named thread per server running a [`WorkerLoop`].

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{error, info};

use crate::catalog::CommandCatalog;
use crate::error::{AppResult, SlmError};
use crate::mailbox::{DeferredMailbox, WorkerState};
use crate::transport::FramedTransport;
use crate::worker::{WorkerConfig, WorkerLoop};

/// Handle to a running server. Dropping it stops the server.
pub struct ServerHandle {
    name: String,
    endpoint: String,
    mailbox: Arc<dyn DeferredMailbox>,
    thread: Option<JoinHandle<AppResult<()>>>,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Start a worker thread that owns `transport` and the context built by
    /// `make_context`.
    ///
    /// The context is constructed on the worker thread so hardware handles
    /// never cross threads. Returns once the context is ready, or with
    /// [`SlmError::Hardware`] if building it failed.
    pub fn spawn<T, C, F>(
        transport: T,
        catalog: CommandCatalog<C>,
        make_context: F,
        mailbox: Arc<dyn DeferredMailbox>,
        config: WorkerConfig,
    ) -> AppResult<Self>
    where
        T: FramedTransport + 'static,
        C: 'static,
        F: FnOnce() -> anyhow::Result<C> + Send + 'static,
    {
        let name = config.name.clone();
        let endpoint = transport.endpoint().to_string();
        let worker_mailbox = mailbox.clone();
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), String>>();

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || -> AppResult<()> {
                let context = match make_context() {
                    Ok(context) => {
                        let _ = ready_tx.send(Ok(()));
                        context
                    }
                    Err(e) => {
                        let message = format!("{e:#}");
                        let _ = ready_tx.send(Err(message.clone()));
                        return Err(SlmError::Hardware(message));
                    }
                };
                WorkerLoop::new(transport, catalog, context, worker_mailbox, config).run()
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!(server = %name, %endpoint, "Server started");
                Ok(Self {
                    name,
                    endpoint,
                    mailbox,
                    thread: Some(thread),
                })
            }
            Ok(Err(message)) => {
                let _ = thread.join();
                Err(SlmError::Hardware(message))
            }
            Err(_) => {
                let _ = thread.join();
                Err(SlmError::WorkerPanicked(name))
            }
        }
    }

    /// Server name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved endpoint the server is bound to.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Mailbox through which deferred requests are completed.
    pub fn mailbox(&self) -> Arc<dyn DeferredMailbox> {
        self.mailbox.clone()
    }

    /// Current worker state.
    pub fn state(&self) -> WorkerState {
        self.mailbox.state()
    }

    /// True once the worker thread has exited, for any reason.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Request `Stopping` and join the worker. Returns the loop's result.
    pub fn stop(&mut self) -> AppResult<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.mailbox.request_stop();
        let result = thread
            .join()
            .map_err(|_| SlmError::WorkerPanicked(self.name.clone()))?;
        info!(server = %self.name, "Server stopped");
        result
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!(server = %self.name, error = %e, "Server ended with an error");
        }
    }
}
