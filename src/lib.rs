//! Single-endpoint device RPC servers for SLM holography and cameras.
//!
//! A server binds one ROUTER endpoint and runs a single worker thread that
//! reads framed requests, looks the command up in a [`catalog`], and either
//! answers inline or parks the request in a deferred reply [`mailbox`] until
//! an external completer supplies the value. Three roles are built in (see
//! [`servers`]): the pattern server driving the phase modulator, a camera
//! server, and a feedback server whose answers come from another program.
//!
//! Client stubs for each role live in [`client`].

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod hardware;
pub mod hologram;
pub mod mailbox;
pub mod pattern_store;
pub mod phase;
pub mod protocol;
pub mod server;
pub mod servers;
pub mod transport;
pub mod worker;

pub use error::{AppResult, SlmError};
pub use server::ServerHandle;
