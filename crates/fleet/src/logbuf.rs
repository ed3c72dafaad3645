//! Log lines waiting to be uploaded with the next heartbeat.
//!
//! Inside an engine process a [`LogForwardLayer`] copies every tracing
//! event into the engine's [`LogBuffer`]. Lines are numbered so the
//! heartbeat can acknowledge exactly what it sent even if newer lines
//! arrived, or old ones were evicted, while the upload was in flight.

use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Lines kept while the controller is unreachable.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Bounded, shareable buffer of log lines. The oldest line is dropped when full.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<Mutex<Lines>>,
}

struct Lines {
    lines: VecDeque<String>,
    /// Sequence number the next pushed line receives.
    next_seq: u64,
    capacity: usize,
    dropped: u64,
}

impl Lines {
    fn front_seq(&self) -> u64 {
        self.next_seq - self.lines.len() as u64
    }
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Lines {
                lines: VecDeque::new(),
                next_seq: 0,
                capacity: capacity.max(1),
                dropped: 0,
            })),
        }
    }

    pub fn push(&self, line: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.lines.len() == inner.capacity {
            inner.lines.pop_front();
            inner.dropped += 1;
        }
        inner.lines.push_back(line.into());
        inner.next_seq += 1;
    }

    /// Copy of the buffered lines plus the mark to acknowledge them with.
    pub fn snapshot(&self) -> (Vec<String>, u64) {
        let inner = self.inner.lock();
        (inner.lines.iter().cloned().collect(), inner.next_seq)
    }

    /// Forget every line numbered below `upto`.
    pub fn acknowledge(&self, upto: u64) {
        let mut inner = self.inner.lock();
        let front = inner.front_seq();
        let sent = upto.saturating_sub(front).min(inner.lines.len() as u64) as usize;
        inner.lines.drain(..sent);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lines evicted because the buffer was full.
    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LogBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogBuffer").field("len", &self.len()).finish()
    }
}

// ── tracing layer ────────────────────────────────────────────────────

/// Tracing layer that renders events as single lines into a [`LogBuffer`].
pub struct LogForwardLayer {
    buffer: LogBuffer,
    min_level: Level,
}

impl LogForwardLayer {
    /// Forward events at `INFO` and above.
    pub fn new(buffer: LogBuffer) -> Self {
        Self {
            buffer,
            min_level: Level::INFO,
        }
    }

    pub fn min_level(mut self, level: Level) -> Self {
        self.min_level = level;
        self
    }
}

impl<S: Subscriber> Layer<S> for LogForwardLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let meta = event.metadata();
        // Level ordering: TRACE > DEBUG > INFO > WARN > ERROR.
        if *meta.level() > self.min_level {
            return;
        }

        let mut fields = LineVisitor::default();
        event.record(&mut fields);
        let line = format!(
            "{} {:>5} {}: {}",
            Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            meta.level(),
            meta.target(),
            fields.finish()
        );
        self.buffer.push(line);
    }
}

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl LineVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
