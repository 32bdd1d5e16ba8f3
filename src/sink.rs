//! The log collaborator. Connection events, failures and delivered messages are all reported as
//! timestamped lines through a [`LogSink`]; the front end decides how to show them.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;

/// Receives log lines. Called concurrently from every connection task.
pub trait LogSink: Send + Sync {
    fn append(&self, line: &str);

    /// Drop everything shown so far.
    fn clear(&self);
}

/// Shared handle used by the relay core to talk to a [`LogSink`].
///
/// Once [`Log::exit`] has been called the sink is never touched again, even by tasks that are
/// still winding down.
#[derive(Clone)]
pub struct Log {
    sink: Arc<dyn LogSink>,
    exit: Arc<AtomicBool>,
}

impl Log {
    pub fn new(sink: Arc<dyn LogSink>) -> Log {
        Log {
            sink,
            exit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Append `msg` with a timestamp, or clear the log when `msg` is `None`.
    pub fn write(&self, msg: Option<&str>) {
        if self.exit.load(Ordering::SeqCst) {
            return;
        }
        match msg {
            None => self.sink.clear(),
            Some(msg) => {
                info!(target: "relay_chat::log", "{}", msg);
                let line = format!("{} {}", Local::now().format("%H:%M"), msg);
                self.sink.append(&line);
            }
        }
    }

    pub fn line<S: AsRef<str>>(&self, msg: S) {
        self.write(Some(msg.as_ref()))
    }

    /// Status and error lines are bracketed as `[/ msg /]` to set them apart from chat text.
    pub fn notice<D: fmt::Display>(&self, msg: D) {
        self.line(format!("[/ {} /]", msg))
    }

    pub fn clear(&self) {
        self.write(None)
    }

    /// Stop delivering to the sink for good.
    pub fn exit(&self) {
        self.exit.store(true, Ordering::SeqCst);
    }

    pub fn is_exited(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Log {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Log")
            .field("exit", &self.is_exited())
            .finish()
    }
}

/// Keeps lines in memory. Handy for embedding the relay and for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Number of lines whose text (after the timestamp) equals `msg`.
    pub fn count(&self, msg: &str) -> usize {
        self.lines
            .lock()
            .iter()
            .filter(|line| strip_timestamp(line) == msg)
            .count()
    }

    pub fn contains(&self, msg: &str) -> bool {
        self.count(msg) > 0
    }
}

impl LogSink for MemorySink {
    fn append(&self, line: &str) {
        self.lines.lock().push(line.to_string());
    }

    fn clear(&self) {
        self.lines.lock().clear();
    }
}

/// The text of a log line without its `HH:MM ` prefix.
pub fn strip_timestamp(line: &str) -> &str {
    match line.find(' ') {
        Some(idx) => &line[idx + 1..],
        None => line,
    }
}
