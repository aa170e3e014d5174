//! The worker loop: sole owner of a server's transport and device context.
//!
//! One iteration:
//! 1. leave if the mailbox says `Stopping`, flushing a final reply to any
//!    parked client;
//! 2. if a deferred request is parked, ask the mailbox for its completion and
//!    send the encoded reply;
//! 3. poll the transport (short timeout while a request is parked) and
//!    dispatch at most one inbound message.
//!
//! Handler failures become `error: <message>` replies. Only a broken
//! transport or `debug_fail_loud` ends the loop with an error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::catalog::{CommandCatalog, CommandMode};
use crate::error::{AppResult, SlmError};
use crate::mailbox::{Completion, DeferredMailbox, MailboxError, PendingRequest, WorkerState};
use crate::protocol::{Reply, SEND_MORE, STOPPING, UNKNOWN_COMMAND};
use crate::transport::{FramedTransport, TransportError};

/// Tunables of one worker loop.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Server name, used for the thread name and log fields.
    pub name: String,
    /// Poll timeout while idle.
    pub poll_timeout: Duration,
    /// Poll timeout while a deferred request waits for completion.
    pub completion_check: Duration,
    /// End the loop on the first handler error instead of replying with it.
    pub fail_loud: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "server".to_string(),
            poll_timeout: Duration::from_millis(500),
            completion_check: Duration::from_millis(20),
            fail_loud: false,
        }
    }
}

/// Outcome of one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    /// Keep iterating.
    Continue,
    /// `Stopping` was observed; the loop is done.
    Exit,
}

/// Single-threaded dispatcher over a [`FramedTransport`].
pub struct WorkerLoop<T, C> {
    transport: T,
    catalog: CommandCatalog<C>,
    context: C,
    mailbox: Arc<dyn DeferredMailbox>,
    config: WorkerConfig,
}

impl<T: FramedTransport, C> WorkerLoop<T, C> {
    /// Assemble a loop. The caller keeps a clone of `mailbox` for stopping
    /// and completing.
    pub fn new(
        transport: T,
        catalog: CommandCatalog<C>,
        context: C,
        mailbox: Arc<dyn DeferredMailbox>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            transport,
            catalog,
            context,
            mailbox,
            config,
        }
    }

    /// Device context owned by the loop.
    pub fn context(&self) -> &C {
        &self.context
    }

    /// Run until `Stopping` or a fatal error.
    pub fn run(mut self) -> AppResult<()> {
        info!(server = %self.config.name, endpoint = %self.transport.endpoint(), "Worker loop started");
        loop {
            match self.run_once() {
                Ok(LoopControl::Continue) => {}
                Ok(LoopControl::Exit) => break,
                Err(e) => {
                    error!(server = %self.config.name, error = %e, "Worker loop failed");
                    self.mailbox.request_stop();
                    return Err(e);
                }
            }
        }
        info!(server = %self.config.name, "Worker loop stopped");
        Ok(())
    }

    /// One iteration of the loop.
    pub fn run_once(&mut self) -> AppResult<LoopControl> {
        if self.mailbox.state() == WorkerState::Stopping {
            self.flush_abandoned();
            return Ok(LoopControl::Exit);
        }

        if self.mailbox.state() != WorkerState::Idle {
            if let Some(completion) = self.mailbox.take_completion() {
                self.send_completion(completion)?;
            }
        }

        let timeout = if self.mailbox.state() == WorkerState::AwaitingCompletion {
            self.config.completion_check.min(self.config.poll_timeout)
        } else {
            self.config.poll_timeout
        };

        match self.transport.poll(timeout) {
            Ok(true) => {}
            Ok(false) => return Ok(LoopControl::Continue),
            Err(e) => return self.recover(e).map(|_| LoopControl::Continue),
        }

        if let Err(e) = self.dispatch_one() {
            return match e {
                SlmError::Transport(e) => self.recover(e).map(|_| LoopControl::Continue),
                other => Err(other),
            };
        }
        Ok(LoopControl::Continue)
    }

    fn recover(&self, e: TransportError) -> AppResult<()> {
        if e.is_fatal() {
            return Err(e.into());
        }
        warn!(server = %self.config.name, error = %e, "Transport error, continuing");
        Ok(())
    }

    /// Read and answer (or park) one inbound message.
    fn dispatch_one(&mut self) -> AppResult<()> {
        let Some(address) = self.transport.begin_message()? else {
            return Ok(());
        };
        // Empty delimiter; its content is not inspected.
        let _delimiter = self.transport.next_frame()?;

        let command = match self.transport.next_frame()? {
            Some(bytes) => String::from_utf8(bytes).ok(),
            None => None,
        };
        let Some(command) = command else {
            debug!(server = %self.config.name, "Message without a command frame");
            return send_reply(&mut self.transport, &address, &Reply::text(SEND_MORE));
        };

        let Some(descriptor) = self.catalog.get(&command) else {
            warn!(server = %self.config.name, %command, "Unknown command");
            return send_reply(&mut self.transport, &address, &Reply::text(UNKNOWN_COMMAND));
        };

        let mut frames = Vec::with_capacity(descriptor.arg_kinds().len());
        while frames.len() < descriptor.arg_kinds().len() {
            match self.transport.next_frame()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        let args = match descriptor.decode_args(&frames) {
            Ok(args) => args,
            Err(e) => {
                warn!(server = %self.config.name, %command, error = %e, "Bad arguments");
                return send_reply(&mut self.transport, &address, &Reply::error(e));
            }
        };

        match descriptor.mode() {
            CommandMode::Sync(handler) => {
                debug!(server = %self.config.name, %command, "Running handler");
                let context = &mut self.context;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(context, &args)));
                let reply = match outcome {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(e)) => {
                        if self.config.fail_loud {
                            return Err(SlmError::Handler {
                                command,
                                message: format!("{e:#}"),
                            });
                        }
                        warn!(server = %self.config.name, %command, error = %format!("{e:#}"), "Handler failed");
                        Reply::error(format!("{e:#}"))
                    }
                    Err(_) => {
                        if self.config.fail_loud {
                            return Err(SlmError::Handler {
                                command,
                                message: "handler panicked".to_string(),
                            });
                        }
                        error!(server = %self.config.name, %command, "Handler panicked");
                        Reply::error("handler panicked")
                    }
                };
                send_reply(&mut self.transport, &address, &reply)
            }
            CommandMode::Deferred(_) => {
                let request = PendingRequest {
                    origin_address: address.clone(),
                    command: command.clone(),
                    args,
                };
                match self.mailbox.park(request) {
                    Ok(ticket) => {
                        info!(server = %self.config.name, %command, ticket = ticket.0, "Awaiting completion");
                        Ok(())
                    }
                    Err(MailboxError::Stopping) => {
                        send_reply(&mut self.transport, &address, &Reply::text(STOPPING))
                    }
                    Err(e) => {
                        warn!(server = %self.config.name, %command, error = %e, "Deferred command rejected");
                        send_reply(&mut self.transport, &address, &Reply::error(e))
                    }
                }
            }
        }
    }

    fn send_completion(&mut self, completion: Completion) -> AppResult<()> {
        let Completion {
            ticket,
            request,
            payload,
        } = completion;
        let reply = match self.catalog.reply_shape(&request.command) {
            Some(shape) => shape.encode(payload).unwrap_or_else(|e| {
                warn!(server = %self.config.name, command = %request.command, error = %e, "Completion payload rejected");
                Reply::error(e)
            }),
            None => Reply::error(format!("'{}' is not a deferred command", request.command)),
        };
        debug!(server = %self.config.name, command = %request.command, ticket = ticket.0, "Sending deferred reply");
        match send_reply(&mut self.transport, &request.origin_address, &reply) {
            Err(SlmError::Transport(e)) => self.recover(e),
            other => other,
        }
    }

    fn flush_abandoned(&mut self) {
        if let Some(request) = self.mailbox.take_abandoned() {
            info!(server = %self.config.name, command = %request.command, "Notifying parked client of shutdown");
            // Best effort; the loop is exiting either way.
            let _ = send_reply(
                &mut self.transport,
                &request.origin_address,
                &Reply::text(STOPPING),
            );
        }
    }
}

/// Drain leftovers of the current message, then send `reply` to `address`.
fn send_reply<T: FramedTransport>(
    transport: &mut T,
    address: &[u8],
    reply: &Reply,
) -> AppResult<()> {
    let dropped = transport.drain()?;
    if dropped > 0 {
        debug!(dropped, "Discarded extra frames before reply");
    }
    transport.send_frames(address, reply.frames())?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mailbox::SharedMailbox;
    use crate::protocol::{decode_f64, decode_f64_array, ArgKind, Frame, Payload, ReplyShape};
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    pub(crate) type Sent = Arc<Mutex<Vec<(Vec<u8>, Vec<Frame>)>>>;

    /// In-memory transport fed with whole messages.
    pub(crate) struct ScriptedTransport {
        inbound: VecDeque<Vec<Vec<u8>>>,
        current: VecDeque<Vec<u8>>,
        pub(crate) sent: Sent,
        pub(crate) closed: bool,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self {
                inbound: VecDeque::new(),
                current: VecDeque::new(),
                sent: Arc::new(Mutex::new(Vec::new())),
                closed: false,
            }
        }

        pub(crate) fn push(&mut self, client: u8, frames: &[&[u8]]) {
            let mut message = vec![vec![client], Vec::new()];
            message.extend(frames.iter().map(|f| f.to_vec()));
            self.inbound.push_back(message);
        }
    }

    impl FramedTransport for ScriptedTransport {
        fn poll(&mut self, timeout: Duration) -> Result<bool, TransportError> {
            if self.closed {
                return Err(TransportError::Closed("scripted".into()));
            }
            if self.inbound.is_empty() {
                std::thread::sleep(timeout.min(Duration::from_millis(1)));
                return Ok(false);
            }
            Ok(true)
        }

        fn begin_message(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            self.current.clear();
            let Some(message) = self.inbound.pop_front() else {
                return Ok(None);
            };
            self.current = message.into();
            Ok(self.current.pop_front())
        }

        fn next_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
            Ok(self.current.pop_front())
        }

        fn drain(&mut self) -> Result<usize, TransportError> {
            let n = self.current.len();
            self.current.clear();
            Ok(n)
        }

        fn send_frames(&mut self, address: &[u8], frames: &[Frame]) -> Result<(), TransportError> {
            self.sent.lock().push((address.to_vec(), frames.to_vec()));
            Ok(())
        }

        fn endpoint(&self) -> &str {
            "scripted://"
        }
    }

    #[derive(Default)]
    struct Device {
        exposure: f64,
    }

    fn catalog() -> CommandCatalog<Device> {
        let mut catalog = CommandCatalog::new();
        catalog
            .register_sync("id", &[], |_, _| Ok(Reply::text("test device")))
            .unwrap()
            .register_sync("set_exposure", &[ArgKind::F64], |dev: &mut Device, args| {
                let value = args.f64(0)?;
                anyhow::ensure!(value > 0.0, "exposure must be positive");
                dev.exposure = value;
                Ok(Reply::ok())
            })
            .unwrap()
            .register_sync("get_exposure", &[], |dev: &mut Device, _| {
                Ok(Reply::f64(dev.exposure))
            })
            .unwrap()
            .register_sync("explode", &[], |_, _| panic!("kaboom"))
            .unwrap()
            .register_deferred(
                "get_spot_amps",
                &[ArgKind::Text, ArgKind::Text, ArgKind::F64],
                ReplyShape::F64Array,
            )
            .unwrap()
            .register_deferred("get_image", &[], ReplyShape::Binary)
            .unwrap();
        catalog
    }

    fn worker(
        transport: ScriptedTransport,
        fail_loud: bool,
    ) -> (WorkerLoop<ScriptedTransport, Device>, SharedMailbox, Sent) {
        let sent = transport.sent.clone();
        let mailbox = SharedMailbox::new();
        let config = WorkerConfig {
            name: "test".into(),
            fail_loud,
            ..WorkerConfig::default()
        };
        let worker = WorkerLoop::new(
            transport,
            catalog(),
            Device::default(),
            Arc::new(mailbox.clone()),
            config,
        );
        (worker, mailbox, sent)
    }

    fn text(frames: &[Frame]) -> &str {
        frames[0].as_text().unwrap()
    }

    fn spot_frames() -> Vec<Vec<u8>> {
        vec![
            b"get_spot_amps".to_vec(),
            b"scan.mat".to_vec(),
            b"scan1".to_vec(),
            (-1.0f64).to_le_bytes().to_vec(),
        ]
    }

    fn push_spot(transport: &mut ScriptedTransport, client: u8) {
        let frames = spot_frames();
        let refs: Vec<&[u8]> = frames.iter().map(Vec::as_slice).collect();
        transport.push(client, &refs);
    }

    #[test]
    fn test_unknown_command_gets_empty_text() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[b"frobnicate"]);
        transport.push(1, &[b"id"]);
        let (mut worker, mailbox, sent) = worker(transport, false);

        worker.run_once().unwrap();
        assert_eq!(mailbox.state(), WorkerState::Idle);
        worker.run_once().unwrap();

        let sent = sent.lock();
        assert_eq!(text(&sent[0].1), "");
        assert_eq!(text(&sent[1].1), "test device");
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_unknown_command_is_logged() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[b"frobnicate"]);
        let (mut worker, _, _) = worker(transport, false);
        worker.run_once().unwrap();
        assert!(logs_contain("Unknown command"));
        assert!(logs_contain("frobnicate"));
    }

    #[test]
    fn test_missing_command_frame_gets_send_more() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[]);
        transport.push(1, &[&[0xff, 0xfe]]);
        let (mut worker, _, sent) = worker(transport, false);
        worker.run_once().unwrap();
        worker.run_once().unwrap();

        let sent = sent.lock();
        assert_eq!(text(&sent[0].1), SEND_MORE);
        assert_eq!(text(&sent[1].1), SEND_MORE);
    }

    #[test]
    fn test_sync_command_updates_context() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[b"set_exposure", &0.05f64.to_le_bytes()]);
        transport.push(1, &[b"get_exposure"]);
        let (mut worker, _, sent) = worker(transport, false);
        worker.run_once().unwrap();
        worker.run_once().unwrap();

        assert_eq!(worker.context().exposure, 0.05);
        let sent = sent.lock();
        assert_eq!(text(&sent[0].1), "ok");
        assert_eq!(decode_f64(&sent[1].1[0].bytes).unwrap(), 0.05);
    }

    #[test]
    fn test_handler_error_becomes_error_reply() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[b"set_exposure", &(-1.0f64).to_le_bytes()]);
        transport.push(1, &[b"set_exposure"]);
        transport.push(1, &[b"explode"]);
        let (mut worker, _, sent) = worker(transport, false);
        for _ in 0..3 {
            assert_eq!(worker.run_once().unwrap(), LoopControl::Continue);
        }

        let sent = sent.lock();
        assert_eq!(text(&sent[0].1), "error: exposure must be positive");
        assert!(text(&sent[1].1).starts_with("error: missing argument 0"));
        assert_eq!(text(&sent[2].1), "error: handler panicked");
    }

    #[test]
    fn test_fail_loud_ends_loop() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[b"set_exposure", &(-1.0f64).to_le_bytes()]);
        let (worker, mailbox, sent) = worker(transport, true);
        let err = worker.run().unwrap_err();
        assert!(matches!(err, SlmError::Handler { .. }));
        assert!(sent.lock().is_empty());
        assert_eq!(mailbox.state(), WorkerState::Stopping);
    }

    #[test]
    fn test_deferred_flow_with_housekeeping_and_conflict() {
        let mut transport = ScriptedTransport::new();
        push_spot(&mut transport, 1);
        transport.push(2, &[b"id"]);
        push_spot(&mut transport, 3);
        let (mut worker, mailbox, sent) = worker(transport, false);

        worker.run_once().unwrap();
        assert_eq!(mailbox.state(), WorkerState::AwaitingCompletion);
        let pending = mailbox.peek_pending().unwrap();
        assert_eq!(pending.args.text(0).unwrap(), "scan.mat");
        assert_eq!(pending.args.f64(2).unwrap(), -1.0);

        worker.run_once().unwrap();
        worker.run_once().unwrap();
        {
            let sent = sent.lock();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0].0, vec![2]);
            assert_eq!(text(&sent[0].1), "test device");
            assert_eq!(sent[1].0, vec![3]);
            assert_eq!(text(&sent[1].1), "error: busy with get_spot_amps");
        }

        mailbox
            .complete("get_spot_amps", Payload::F64Array(vec![1.0, 1.0, 1.0]))
            .unwrap();
        assert!(mailbox
            .complete("get_spot_amps", Payload::F64Array(vec![2.0]))
            .is_err());
        worker.run_once().unwrap();

        let sent = sent.lock();
        assert_eq!(sent[2].0, vec![1]);
        assert_eq!(
            decode_f64_array(&sent[2].1[0].bytes).unwrap(),
            vec![1.0, 1.0, 1.0]
        );
        assert_eq!(mailbox.state(), WorkerState::Idle);
    }

    #[test]
    fn test_payload_shape_mismatch_reaches_client_as_error() {
        let mut transport = ScriptedTransport::new();
        transport.push(4, &[b"get_image"]);
        let (mut worker, mailbox, sent) = worker(transport, false);
        worker.run_once().unwrap();
        mailbox
            .complete("get_image", Payload::Text("no frame".into()))
            .unwrap();
        worker.run_once().unwrap();

        let sent = sent.lock();
        assert!(text(&sent[0].1).starts_with("error: payload Text"));
    }

    #[test]
    fn test_stop_flushes_parked_client() {
        let mut transport = ScriptedTransport::new();
        push_spot(&mut transport, 5);
        let (mut worker, mailbox, sent) = worker(transport, false);
        worker.run_once().unwrap();
        mailbox.request_stop();
        assert_eq!(worker.run_once().unwrap(), LoopControl::Exit);

        let sent = sent.lock();
        assert_eq!(sent[0].0, vec![5]);
        assert_eq!(text(&sent[0].1), STOPPING);
    }

    #[test]
    fn test_closed_transport_is_fatal() {
        let mut transport = ScriptedTransport::new();
        transport.closed = true;
        let (mut worker, _, _) = worker(transport, false);
        assert!(matches!(
            worker.run_once(),
            Err(SlmError::Transport(TransportError::Closed(_)))
        ));
    }

    #[test]
    fn test_extra_frames_are_drained() {
        let mut transport = ScriptedTransport::new();
        transport.push(1, &[b"id", b"junk", b"more junk"]);
        transport.push(1, &[b"id"]);
        let (mut worker, _, sent) = worker(transport, false);
        worker.run_once().unwrap();
        worker.run_once().unwrap();
        assert_eq!(sent.lock().len(), 2);
    }
}
