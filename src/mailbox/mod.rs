//! One-slot rendezvous between the worker loop and an external completer.
//!
//! The worker parks at most one deferred request. A completer (embedding
//! thread, or another process through [`FileMailbox`]) inspects it with
//! [`DeferredMailbox::peek_pending`] and answers it with
//! [`DeferredMailbox::complete`]. The worker picks the answer up on its next
//! iteration with [`DeferredMailbox::take_completion`].
//!
//! The worker state, the parked request and the payload live behind a single
//! mutex, and every transition happens while holding it. The slot is a tagged
//! enum so an illegal transition, such as completing with nothing parked, can
//! only surface as an error value.

pub mod file;
pub mod shared;

pub use file::FileMailbox;
pub use shared::SharedMailbox;

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{Args, Payload};

/// Worker lifecycle as observed through the mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState {
    /// Nothing parked.
    Idle,
    /// A deferred request waits for its completer.
    AwaitingCompletion,
    /// Payload supplied, reply not yet sent.
    ReplyReady,
    /// Terminal. The worker leaves its loop.
    Stopping,
}

/// The parked deferred request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingRequest {
    /// Routing frame of the waiting client.
    #[serde(skip)]
    pub origin_address: Vec<u8>,
    /// Command name.
    pub command: String,
    /// Decoded arguments.
    pub args: Args,
}

/// Identifies one `park`. Tickets increase monotonically per mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(pub u64);

/// A completed request handed back to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Ticket returned by `park`.
    pub ticket: Ticket,
    /// The request that was parked.
    pub request: PendingRequest,
    /// Value supplied by the completer.
    pub payload: Payload,
}

/// Errors reported to the mailbox caller. They never reach a network client
/// except `Busy`, which the worker turns into a conflict reply.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// A request is already parked.
    #[error("busy with {parked}")]
    Busy {
        /// Command currently parked.
        parked: String,
    },

    /// Nothing is waiting for a completion.
    #[error("no pending request")]
    NothingPending,

    /// Completion for a command other than the parked one.
    #[error("pending request is '{pending}', not '{supplied}'")]
    CommandMismatch {
        /// Command currently parked.
        pending: String,
        /// Command named by the completer.
        supplied: String,
    },

    /// Server is stopping.
    #[error("server stopping")]
    Stopping,

    /// File channel could not be written or read.
    #[error("mailbox file: {0}")]
    File(String),
}

/// Deferred reply rendezvous.
///
/// `park`, `take_completion`, `request_stop` and `take_abandoned` belong to
/// the worker side. Completers only call `peek_pending` and `complete`.
pub trait DeferredMailbox: Send + Sync {
    /// Park a request. Fails with [`MailboxError::Busy`] when one is already
    /// parked.
    fn park(&self, request: PendingRequest) -> Result<Ticket, MailboxError>;

    /// The request awaiting completion, if any.
    fn peek_pending(&self) -> Option<PendingRequest>;

    /// Supply the payload for the parked request. Honoured once per `park`.
    fn complete(&self, command: &str, payload: Payload) -> Result<(), MailboxError>;

    /// Hand a ready completion to the worker and return to `Idle`.
    fn take_completion(&self) -> Option<Completion>;

    /// Current state.
    fn state(&self) -> WorkerState;

    /// Move to `Stopping`. Any parked request becomes abandoned.
    fn request_stop(&self);

    /// Request left behind by `request_stop`, taken at most once.
    fn take_abandoned(&self) -> Option<PendingRequest>;
}

#[derive(Debug)]
enum Slot {
    Idle,
    Awaiting {
        ticket: Ticket,
        request: PendingRequest,
    },
    Ready {
        ticket: Ticket,
        request: PendingRequest,
        payload: Payload,
    },
    Stopping {
        abandoned: Option<PendingRequest>,
    },
}

#[derive(Debug)]
struct Inner {
    slot: Slot,
    next_ticket: u64,
}

/// Lock-guarded slot shared by the mailbox implementations.
#[derive(Debug)]
pub struct MailboxCore {
    inner: Mutex<Inner>,
}

impl Default for MailboxCore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailboxCore {
    /// Empty, idle mailbox.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slot: Slot::Idle,
                next_ticket: 1,
            }),
        }
    }

    /// See [`DeferredMailbox::park`].
    pub fn park(&self, request: PendingRequest) -> Result<Ticket, MailboxError> {
        let mut inner = self.inner.lock();
        match &inner.slot {
            Slot::Idle => {}
            Slot::Awaiting { request: parked, .. } | Slot::Ready { request: parked, .. } => {
                return Err(MailboxError::Busy {
                    parked: parked.command.clone(),
                });
            }
            Slot::Stopping { .. } => return Err(MailboxError::Stopping),
        }
        let ticket = Ticket(inner.next_ticket);
        inner.next_ticket += 1;
        debug!(command = %request.command, ticket = ticket.0, "Parked deferred request");
        inner.slot = Slot::Awaiting { ticket, request };
        Ok(ticket)
    }

    /// Undo a `park` whose side channel could not be set up.
    pub(crate) fn unpark(&self, ticket: Ticket) -> Option<PendingRequest> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Awaiting { ticket: t, request } if t == ticket => Some(request),
            other => {
                inner.slot = other;
                None
            }
        }
    }

    /// See [`DeferredMailbox::peek_pending`].
    pub fn peek_pending(&self) -> Option<PendingRequest> {
        match &self.inner.lock().slot {
            Slot::Awaiting { request, .. } => Some(request.clone()),
            _ => None,
        }
    }

    /// See [`DeferredMailbox::complete`].
    pub fn complete(&self, command: &str, payload: Payload) -> Result<(), MailboxError> {
        let mut inner = self.inner.lock();
        let (ticket, request) = match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Awaiting { ticket, request } if request.command == command => (ticket, request),
            Slot::Awaiting { ticket, request } => {
                let pending = request.command.clone();
                inner.slot = Slot::Awaiting { ticket, request };
                warn!(%pending, supplied = %command, "Rejected completion for wrong command");
                return Err(MailboxError::CommandMismatch {
                    pending,
                    supplied: command.to_string(),
                });
            }
            other @ (Slot::Idle | Slot::Ready { .. }) => {
                inner.slot = other;
                return Err(MailboxError::NothingPending);
            }
            other @ Slot::Stopping { .. } => {
                inner.slot = other;
                return Err(MailboxError::Stopping);
            }
        };
        debug!(%command, ticket = ticket.0, "Completion supplied");
        inner.slot = Slot::Ready {
            ticket,
            request,
            payload,
        };
        Ok(())
    }

    /// See [`DeferredMailbox::take_completion`].
    pub fn take_completion(&self) -> Option<Completion> {
        let mut inner = self.inner.lock();
        match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Ready {
                ticket,
                request,
                payload,
            } => Some(Completion {
                ticket,
                request,
                payload,
            }),
            other => {
                inner.slot = other;
                None
            }
        }
    }

    /// See [`DeferredMailbox::state`].
    pub fn state(&self) -> WorkerState {
        match self.inner.lock().slot {
            Slot::Idle => WorkerState::Idle,
            Slot::Awaiting { .. } => WorkerState::AwaitingCompletion,
            Slot::Ready { .. } => WorkerState::ReplyReady,
            Slot::Stopping { .. } => WorkerState::Stopping,
        }
    }

    /// See [`DeferredMailbox::request_stop`].
    pub fn request_stop(&self) {
        let mut inner = self.inner.lock();
        let abandoned = match std::mem::replace(&mut inner.slot, Slot::Idle) {
            Slot::Idle => None,
            Slot::Awaiting { request, .. } | Slot::Ready { request, .. } => Some(request),
            Slot::Stopping { abandoned } => abandoned,
        };
        inner.slot = Slot::Stopping { abandoned };
    }

    /// See [`DeferredMailbox::take_abandoned`].
    pub fn take_abandoned(&self) -> Option<PendingRequest> {
        match &mut self.inner.lock().slot {
            Slot::Stopping { abandoned } => abandoned.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::Arg;

    pub(crate) fn spot_request() -> PendingRequest {
        PendingRequest {
            origin_address: vec![0, 1, 2, 3],
            command: "get_spot_amps".into(),
            args: Args::new(vec![
                Arg::Text("scan.mat".into()),
                Arg::Text("scan1".into()),
                Arg::F64(-1.0),
            ]),
        }
    }

    #[test]
    fn test_full_cycle() {
        let core = MailboxCore::new();
        assert_eq!(core.state(), WorkerState::Idle);

        let ticket = core.park(spot_request()).unwrap();
        assert_eq!(core.state(), WorkerState::AwaitingCompletion);
        assert_eq!(core.peek_pending().unwrap().command, "get_spot_amps");
        assert!(core.take_completion().is_none());

        core.complete("get_spot_amps", Payload::F64Array(vec![1.0, 1.0, 1.0]))
            .unwrap();
        assert_eq!(core.state(), WorkerState::ReplyReady);
        assert!(core.peek_pending().is_none());

        let completion = core.take_completion().unwrap();
        assert_eq!(completion.ticket, ticket);
        assert_eq!(completion.request.origin_address, vec![0, 1, 2, 3]);
        assert_eq!(completion.payload, Payload::F64Array(vec![1.0, 1.0, 1.0]));
        assert_eq!(core.state(), WorkerState::Idle);
    }

    #[test]
    fn test_second_park_is_busy() {
        let core = MailboxCore::new();
        core.park(spot_request()).unwrap();
        let err = core.park(spot_request()).unwrap_err();
        assert_eq!(err.to_string(), "busy with get_spot_amps");
    }

    #[test]
    fn test_complete_is_honoured_once() {
        let core = MailboxCore::new();
        core.park(spot_request()).unwrap();
        core.complete("get_spot_amps", Payload::F64Array(vec![1.0]))
            .unwrap();
        assert_eq!(
            core.complete("get_spot_amps", Payload::F64Array(vec![9.0])),
            Err(MailboxError::NothingPending)
        );
        assert_eq!(
            core.take_completion().unwrap().payload,
            Payload::F64Array(vec![1.0])
        );
    }

    #[test]
    fn test_complete_without_park() {
        let core = MailboxCore::new();
        assert_eq!(
            core.complete("get_spot_amps", Payload::F64(1.0)),
            Err(MailboxError::NothingPending)
        );
        assert_eq!(core.state(), WorkerState::Idle);
    }

    #[test]
    fn test_mismatched_command_keeps_request_parked() {
        let core = MailboxCore::new();
        core.park(spot_request()).unwrap();
        let err = core
            .complete("get_exposure", Payload::F64(0.1))
            .unwrap_err();
        assert!(matches!(err, MailboxError::CommandMismatch { .. }));
        assert_eq!(core.state(), WorkerState::AwaitingCompletion);
    }

    #[test]
    fn test_park_after_completion_is_accepted() {
        let core = MailboxCore::new();
        let first = core.park(spot_request()).unwrap();
        core.complete("get_spot_amps", Payload::F64(1.0)).unwrap();
        core.take_completion().unwrap();
        let second = core.park(spot_request()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_stop_abandons_parked_request() {
        let core = MailboxCore::new();
        core.park(spot_request()).unwrap();
        core.request_stop();
        assert_eq!(core.state(), WorkerState::Stopping);
        assert_eq!(
            core.complete("get_spot_amps", Payload::F64(1.0)),
            Err(MailboxError::Stopping)
        );
        assert_eq!(core.park(spot_request()), Err(MailboxError::Stopping));
        assert_eq!(core.take_abandoned().unwrap().command, "get_spot_amps");
        assert!(core.take_abandoned().is_none());
    }

    #[test]
    fn test_unpark_restores_idle() {
        let core = MailboxCore::new();
        let ticket = core.park(spot_request()).unwrap();
        assert!(core.unpark(Ticket(ticket.0 + 1)).is_none());
        assert!(core.unpark(ticket).is_some());
        assert_eq!(core.state(), WorkerState::Idle);
    }
}
