//! Channel-backed wrapper around the line parser.
//!
//! `StreamParser` is the handle the hub holds: the supervisor's blocking
//! reader thread pushes lines in, a single consumer task drains typed
//! events out of the bounded receiver.

use std::sync::Mutex;

use tokio::sync::mpsc;

use super::parser::LineParser;
use super::types::ControlEvent;

/// Default event channel capacity.
pub const EVENT_BUFFER: usize = 512;

pub struct StreamParser {
    inner: Mutex<StreamInner>,
}

struct StreamInner {
    parser: LineParser,
    /// `None` once closed; feeding becomes a no-op.
    events: Option<mpsc::Sender<ControlEvent>>,
}

impl StreamParser {
    /// Create a parser and the receiving end of its event channel.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<ControlEvent>) {
        let (tx, rx) = mpsc::channel(buffer);
        let parser = Self {
            inner: Mutex::new(StreamInner {
                parser: LineParser::new(),
                events: Some(tx),
            }),
        };
        (parser, rx)
    }

    /// Feed one protocol line. Must be called from a blocking thread (the
    /// supervisor reader); backpressure blocks the caller when the
    /// consumer falls behind.
    pub fn feed_line(&self, line: &str) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = inner.events.clone() else {
            return;
        };
        inner.parser.feed_line(line, &mut |ev| {
            let _ = tx.blocking_send(ev);
        });
    }

    /// Finalize the parser and close the event channel; the receiver
    /// drains whatever is buffered and then terminates. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = inner.events.take() else {
            return;
        };
        // Callable from async context, so the final event is best-effort.
        inner.parser.finish(&mut |ev| {
            let _ = tx.try_send(ev);
        });
    }
}
