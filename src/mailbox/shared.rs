//! In-process mailbox. The embedding application keeps a clone and completes
//! parked requests from its own thread.

use std::sync::Arc;

use super::{Completion, DeferredMailbox, MailboxCore, MailboxError, PendingRequest, Ticket, WorkerState};
use crate::protocol::Payload;

/// Cloneable handle to a [`MailboxCore`].
#[derive(Debug, Clone, Default)]
pub struct SharedMailbox {
    core: Arc<MailboxCore>,
}

impl SharedMailbox {
    /// Fresh idle mailbox.
    pub fn new() -> Self {
        Self::default()
    }
}

impl DeferredMailbox for SharedMailbox {
    fn park(&self, request: PendingRequest) -> Result<Ticket, MailboxError> {
        self.core.park(request)
    }

    fn peek_pending(&self) -> Option<PendingRequest> {
        self.core.peek_pending()
    }

    fn complete(&self, command: &str, payload: Payload) -> Result<(), MailboxError> {
        self.core.complete(command, payload)
    }

    fn take_completion(&self) -> Option<Completion> {
        self.core.take_completion()
    }

    fn state(&self) -> WorkerState {
        self.core.state()
    }

    fn request_stop(&self) {
        self.core.request_stop()
    }

    fn take_abandoned(&self) -> Option<PendingRequest> {
        self.core.take_abandoned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::tests::spot_request;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_completion_from_another_thread() {
        let mailbox = SharedMailbox::new();
        mailbox.park(spot_request()).unwrap();

        let completer = mailbox.clone();
        let handle = thread::spawn(move || {
            while completer.peek_pending().is_none() {
                thread::sleep(Duration::from_millis(1));
            }
            completer.complete("get_spot_amps", Payload::F64Array(vec![1.0, 1.0, 1.0]))
        });
        handle.join().unwrap().unwrap();

        let completion = mailbox.take_completion().unwrap();
        assert_eq!(completion.payload, Payload::F64Array(vec![1.0, 1.0, 1.0]));
        assert_eq!(mailbox.state(), WorkerState::Idle);
    }
}
