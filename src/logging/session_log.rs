//! Per-session append-only log buffer.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// One log line with its position in the buffer.
///
/// Indices are monotonically increasing within a reset generation; readers
/// polling `GetLogMessagesFromIndex` resume from the last index they saw and
/// compare `reset_count` to detect that the buffer was cleared under them.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogMessage {
    pub index: u64,
    pub content: String,
}

#[derive(Default)]
struct LogBuffer {
    messages: Vec<LogMessage>,
    next_index: u64,
    reset_count: u64,
}

/// A named, concurrently-writable log stream for one scan or encode session.
///
/// The engine-callback thread is the sole appender during an encode; router
/// threads only take fully-formed copies under the buffer lock.
pub struct SessionLog {
    filename: String,
    created: Instant,
    // 0 = not yet linked to an encode
    activity_id: AtomicU64,
    inner: Mutex<LogBuffer>,
}

impl SessionLog {
    pub fn new(filename: &str) -> Self {
        Self {
            filename: filename.to_string(),
            created: Instant::now(),
            activity_id: AtomicU64::new(0),
            inner: Mutex::new(LogBuffer::default()),
        }
    }

    /// The filename-like key this stream is registered under.
    pub fn file_name(&self) -> &str {
        &self.filename
    }

    /// Link this stream to an active encode after creation.
    pub fn set_activity_id(&self, id: u64) {
        self.activity_id.store(id, Ordering::Relaxed);
    }

    pub fn activity_id(&self) -> u64 {
        self.activity_id.load(Ordering::Relaxed)
    }

    /// Append one line, stamped with time elapsed since stream creation.
    pub fn log_message(&self, content: &str) {
        let elapsed = self.created.elapsed().as_secs_f64();
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let index = buf.next_index;
        buf.next_index += 1;
        buf.messages.push(LogMessage {
            index,
            content: format!("[{:9.3}] {}", elapsed, content),
        });
    }

    /// Full copy of the accumulated buffer.
    pub fn messages(&self) -> Vec<LogMessage> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.messages.clone()
    }

    /// Copy of all messages with index >= `start`.
    pub fn messages_from_index(&self, start: u64) -> Vec<LogMessage> {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.messages
            .iter()
            .filter(|m| m.index >= start)
            .cloned()
            .collect()
    }

    /// Clear the buffer and bump the reset generation. The slot in the
    /// registry is kept; indices restart from zero.
    pub fn reset(&self) {
        let mut buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.messages.clear();
        buf.next_index = 0;
        buf.reset_count += 1;
    }

    /// Number of times `reset()` has been called on this stream.
    pub fn reset_count(&self) -> u64 {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.reset_count
    }

    pub fn message_count(&self) -> usize {
        let buf = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        buf.messages.len()
    }
}
