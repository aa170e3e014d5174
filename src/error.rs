//! Custom error types for the application.
//!
//! This module defines the primary error type, `SlmError`, used by the server
//! runtime and the `slmd` binary. Using the `thiserror` crate, it gathers the
//! narrower error enums of each layer into one type so startup and shutdown
//! paths can use the `?` operator throughout.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: a configuration file could not be loaded or failed validation.
//!   This is the only fatal startup error: a server without an endpoint url
//!   refuses to start.
//! - **`Transport`**: the framed transport failed to bind or broke while running.
//!   "No data available" is never an error; it is `Ok(None)` at the transport.
//! - **`Catalog`**: a command catalog was built with a duplicate or empty name.
//! - **`Mailbox`**: the file mailbox could not write its exchange file.
//! - **`Hardware`**: a device backend could not be created on the worker thread.
//! - **`Handler`**: a command handler failed while `debug_fail_loud` is enabled.
//!   With the toggle off, handler failures become `error: <message>` replies
//!   and never reach this type.
//! - **`WorkerPanicked`**: the worker thread could not be joined cleanly.

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::config::ConfigError;
use crate::mailbox::MailboxError;
use crate::transport::TransportError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, SlmError>;

/// Top-level error for servers and the `slmd` binary.
#[derive(Error, Debug)]
pub enum SlmError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The framed transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A command catalog was malformed.
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// The deferred reply mailbox could not be set up.
    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    /// I/O failure outside the transport (pattern files, mailbox files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A hardware backend could not be initialized.
    #[error("Hardware error: {0}")]
    Hardware(String),

    /// A handler failed and the server runs with `debug_fail_loud`.
    #[error("Handler for '{command}' failed: {message}")]
    Handler {
        /// Command whose handler failed.
        command: String,
        /// Rendered error chain.
        message: String,
    },

    /// The worker thread panicked or vanished before reporting.
    #[error("Worker thread for '{0}' panicked")]
    WorkerPanicked(String),
}
