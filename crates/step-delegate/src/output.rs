//! Step output streams that persist into the build log.
//!
//! Every write becomes a `Log` event for the writer's origin. A redacting
//! writer holds output back until a line boundary so a secret split across
//! writes is still seen whole by the filter.
//!
//! [`EventWriter`] is a [`tokio::io::AsyncWrite`]: the step runtime streams
//! into it with `AsyncWriteExt` or `tokio::io::copy`, and shutting it down
//! flushes the held-back tail.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{ready, Context, Poll};

use build_ledger::{Build, BuildEvent, LogEvent, Origin};
use tokio::io::AsyncWrite;

use crate::clock::Clock;

/// Rewrites output text before it is persisted.
pub type OutputFilter = Arc<dyn Fn(&str) -> String + Send + Sync>;

type SaveFuture = Pin<Box<dyn Future<Output = io::Result<()>> + Send>>;

/// Buffer state a write leaves behind once its event is saved.
#[derive(Debug, Default)]
struct Staged {
    dangling: Vec<u8>,
    partial_line: String,
}

/// A save started by `poll_write` or `poll_shutdown`. Nothing it stages
/// takes effect unless the save succeeds.
struct InFlight {
    save: SaveFuture,
    staged: Staged,
    accepted: usize,
}

/// Output sink for one channel (stdout or stderr) of one step.
pub struct EventWriter {
    build: Arc<dyn Build>,
    origin: Origin,
    clock: Arc<dyn Clock>,
    filter: Option<OutputFilter>,
    /// Trailing bytes of an incomplete UTF-8 sequence
    dangling: Vec<u8>,
    /// Text after the last line break (redacting writers only)
    partial_line: String,
    /// Only ever accessed through `get_mut`; the mutex makes the writer `Sync`
    in_flight: Mutex<Option<InFlight>>,
    closed: bool,
}

impl EventWriter {
    /// Writer that persists output verbatim.
    pub fn new(build: Arc<dyn Build>, origin: Origin, clock: Arc<dyn Clock>) -> Self {
        EventWriter {
            build,
            origin,
            clock,
            filter: None,
            dangling: Vec::new(),
            partial_line: String::new(),
            in_flight: Mutex::new(None),
            closed: false,
        }
    }

    /// Writer that passes complete lines through `filter` before persisting.
    pub fn with_redaction(
        build: Arc<dyn Build>,
        origin: Origin,
        clock: Arc<dyn Clock>,
        filter: OutputFilter,
    ) -> Self {
        EventWriter {
            filter: Some(filter),
            ..EventWriter::new(build, origin, clock)
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn is_redacting(&self) -> bool {
        self.filter.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Payload to persist for `buf` and the buffers to keep if it is saved.
    fn stage(&self, buf: &[u8]) -> (String, Staged) {
        let mut bytes = self.dangling.clone();
        bytes.extend_from_slice(buf);
        let (text, dangling) = decode_utf8(&bytes);

        match &self.filter {
            None => (
                text,
                Staged {
                    dangling,
                    partial_line: String::new(),
                },
            ),
            Some(filter) => {
                let mut lines = self.partial_line.clone();
                lines.push_str(&text);
                match lines.rfind('\n') {
                    Some(idx) => {
                        let partial_line = lines.split_off(idx + 1);
                        (
                            filter(&lines),
                            Staged {
                                dangling,
                                partial_line,
                            },
                        )
                    }
                    None => (
                        String::new(),
                        Staged {
                            dangling,
                            partial_line: lines,
                        },
                    ),
                }
            }
        }
    }

    /// Everything still held back, filtered; empties the buffers.
    fn take_tail(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.dangling).into_owned();
        self.dangling.clear();

        match &self.filter {
            None => tail,
            Some(filter) => {
                let mut pending = std::mem::take(&mut self.partial_line);
                pending.push_str(&tail);
                filter(&pending)
            }
        }
    }

    fn commit(&mut self, staged: Staged) {
        self.dangling = staged.dangling;
        self.partial_line = staged.partial_line;
    }

    fn start_save(&mut self, payload: String, staged: Staged, accepted: usize) {
        let build = Arc::clone(&self.build);
        let event = BuildEvent::Log(LogEvent {
            origin: self.origin.clone(),
            time: self.clock.now().timestamp(),
            payload,
        });
        let save: SaveFuture = Box::pin(async move {
            build.save_event(event).await.map_err(io::Error::other)
        });

        *self.in_flight_slot() = Some(InFlight {
            save,
            staged,
            accepted,
        });
    }

    fn in_flight_slot(&mut self) -> &mut Option<InFlight> {
        self.in_flight
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Drive the in-flight save, if any. `Ready(None)` when idle.
    fn poll_in_flight(&mut self, cx: &mut Context<'_>) -> Poll<Option<io::Result<usize>>> {
        let slot = self.in_flight_slot();
        let outcome = match slot.as_mut() {
            None => return Poll::Ready(None),
            Some(in_flight) => ready!(in_flight.save.as_mut().poll(cx)),
        };

        let Some(done) = slot.take() else {
            return Poll::Ready(None);
        };
        Poll::Ready(Some(outcome.map(|()| {
            self.commit(done.staged);
            done.accepted
        })))
    }
}

impl AsyncWrite for EventWriter {
    /// Accepts all of `buf` once its event is saved. A rejected save accepts
    /// nothing: the writer's buffers are left as they were.
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("output for {} already closed", this.origin.id),
            )));
        }

        // a write that returned Pending is completed by the caller's retry
        if let Some(outcome) = ready!(this.poll_in_flight(cx)) {
            return Poll::Ready(outcome);
        }

        let (payload, staged) = this.stage(buf);
        if payload.is_empty() {
            this.commit(staged);
            return Poll::Ready(Ok(buf.len()));
        }

        this.start_save(payload, staged, buf.len());
        this.poll_in_flight(cx)
            .map(|outcome| outcome.unwrap_or(Ok(buf.len())))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(self.get_mut().poll_in_flight(cx)) {
            Some(Err(err)) => Poll::Ready(Err(err)),
            _ => Poll::Ready(Ok(())),
        }
    }

    /// Persist whatever is held back and refuse further writes. Idempotent.
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(Err(err)) = ready!(this.poll_in_flight(cx)) {
            return Poll::Ready(Err(err));
        }

        if !this.closed {
            this.closed = true;
            let tail = this.take_tail();
            if !tail.is_empty() {
                this.start_save(tail, Staged::default(), 0);
            }
        }

        match ready!(this.poll_in_flight(cx)) {
            Some(Err(err)) => Poll::Ready(Err(err)),
            _ => Poll::Ready(Ok(())),
        }
    }
}

/// Decode `bytes`, replacing each invalid sequence with U+FFFD. An
/// incomplete sequence at the very end is returned undecoded.
fn decode_utf8(bytes: &[u8]) -> (String, Vec<u8>) {
    let mut text = String::with_capacity(bytes.len());
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                return (text, Vec::new());
            }
            Err(err) => {
                let (valid, after) = rest.split_at(err.valid_up_to());
                text.push_str(&String::from_utf8_lossy(valid));
                match err.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &after[len..];
                    }
                    None => return (text, after.to_vec()),
                }
            }
        }
    }
}

impl std::fmt::Debug for EventWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventWriter")
            .field("origin", &self.origin)
            .field("redacting", &self.is_redacting())
            .field("closed", &self.closed)
            .finish()
    }
}
