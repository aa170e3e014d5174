//! File-polling mailbox for completers that live in another process.
//!
//! The parked request is published as `{"request": <command>, "data": <args>}`.
//! The external program answers by overwriting the same file with
//! `{"request": "reply", "msg_type": <command>, "data": <payload>}`. The
//! worker reads the file at most once per poll interval while a request is
//! parked, and resets it to `{"request": null}` once the reply is consumed.
//!
//! Writes go through a temp file and a rename so the external reader never
//! sees a half-written record.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Completion, DeferredMailbox, MailboxCore, MailboxError, PendingRequest, Ticket, WorkerState};
use crate::protocol::{Args, Payload};

/// Marker written by the external completer in the `request` field.
pub const REPLY_MARKER: &str = "reply";

#[derive(Serialize)]
struct RequestRecord<'a> {
    request: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Args>,
}

#[derive(Debug, Deserialize)]
struct InboundRecord {
    request: Option<String>,
    #[serde(default)]
    msg_type: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Mailbox whose completer talks through a JSON file.
#[derive(Debug)]
pub struct FileMailbox {
    core: MailboxCore,
    path: PathBuf,
    poll_interval: Duration,
    last_read: Mutex<Option<Instant>>,
}

impl FileMailbox {
    /// Create the mailbox and reset `path` to the idle record.
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Result<Self, MailboxError> {
        let mailbox = Self {
            core: MailboxCore::new(),
            path: path.into(),
            poll_interval,
            last_read: Mutex::new(None),
        };
        mailbox.write_idle()?;
        Ok(mailbox)
    }

    /// Location of the exchange file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_idle(&self) -> Result<(), MailboxError> {
        write_json_atomic(
            &self.path,
            &RequestRecord {
                request: None,
                data: None,
            },
        )
        .map_err(|e| MailboxError::File(format!("{}: {e}", self.path.display())))
    }

    fn write_request(&self, request: &PendingRequest) -> Result<(), MailboxError> {
        write_json_atomic(
            &self.path,
            &RequestRecord {
                request: Some(&request.command),
                data: Some(&request.args),
            },
        )
        .map_err(|e| MailboxError::File(format!("{}: {e}", self.path.display())))
    }

    fn poll_due(&self) -> bool {
        let mut last = self.last_read.lock();
        let now = Instant::now();
        match *last {
            Some(at) if now.duration_since(at) < self.poll_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Read the exchange file and apply a reply record if one is present.
    fn check_file(&self) {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Mailbox file not readable");
                return;
            }
        };
        // An external writer may be mid-write; try again next interval.
        let record: InboundRecord = match serde_json::from_str(&contents) {
            Ok(record) => record,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "Mailbox file not parseable yet");
                return;
            }
        };
        if record.request.as_deref() != Some(REPLY_MARKER) {
            return;
        }

        let result = match (record.msg_type, record.data) {
            (Some(command), Some(data)) => match serde_json::from_value::<Payload>(data) {
                Ok(payload) => self.core.complete(&command, payload),
                Err(e) => Err(MailboxError::File(format!("unusable reply data: {e}"))),
            },
            _ => Err(MailboxError::File(
                "reply record needs msg_type and data".to_string(),
            )),
        };

        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "Rejected reply from mailbox file");
            if let Some(pending) = self.core.peek_pending() {
                if let Err(e) = self.write_request(&pending) {
                    warn!(error = %e, "Could not republish pending request");
                }
            }
        }
    }
}

impl DeferredMailbox for FileMailbox {
    fn park(&self, request: PendingRequest) -> Result<Ticket, MailboxError> {
        let ticket = self.core.park(request.clone())?;
        if let Err(e) = self.write_request(&request) {
            self.core.unpark(ticket);
            return Err(e);
        }
        *self.last_read.lock() = None;
        Ok(ticket)
    }

    fn peek_pending(&self) -> Option<PendingRequest> {
        self.core.peek_pending()
    }

    fn complete(&self, command: &str, payload: Payload) -> Result<(), MailboxError> {
        self.core.complete(command, payload)
    }

    fn take_completion(&self) -> Option<Completion> {
        if self.core.state() == WorkerState::AwaitingCompletion && self.poll_due() {
            self.check_file();
        }
        let completion = self.core.take_completion()?;
        if let Err(e) = self.write_idle() {
            warn!(error = %e, "Could not reset mailbox file");
        }
        Some(completion)
    }

    fn state(&self) -> WorkerState {
        self.core.state()
    }

    fn request_stop(&self) {
        self.core.request_stop();
        if let Err(e) = self.write_idle() {
            warn!(error = %e, "Could not reset mailbox file on stop");
        }
    }

    fn take_abandoned(&self) -> Option<PendingRequest> {
        self.core.take_abandoned()
    }
}

/// Serialize `value` next to `path` and rename it into place.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    let serialized = serde_json::to_string(value).map_err(io::Error::other)?;
    let temp_path = path.with_extension(format!("json.{}.tmp", process::id()));
    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;
        file.write_all(serialized.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&temp_path, path)
}
