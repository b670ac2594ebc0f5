//! Run log buffering
//!
//! Actions write user-visible log lines into a buffer during a run; the
//! owner of the run drains it periodically (the orchestrator persists the
//! entries, the CLI prints them).

use convoy_core::domain::log::LogEntry;
use std::sync::{Arc, Mutex};

/// Thread-safe buffer of run log entries
pub trait LogBufferService: Send + Sync {
    /// Adds a log entry to the buffer
    fn add_entry(&self, entry: LogEntry);

    /// Returns all buffered entries and clears the buffer
    fn drain(&self) -> Vec<LogEntry>;
}

/// In-memory implementation of LogBufferService
#[derive(Clone, Default)]
pub struct InMemoryLogBuffer {
    buffer: Arc<Mutex<Vec<LogEntry>>>,
}

impl InMemoryLogBuffer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogBufferService for InMemoryLogBuffer {
    fn add_entry(&self, entry: LogEntry) {
        // A panicked writer must not lose everyone else's log lines
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(entry);
    }

    fn drain(&self) -> Vec<LogEntry> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use convoy_core::domain::log::LogLevel;

    #[test]
    fn test_drain_empties_buffer() {
        let buffer = InMemoryLogBuffer::new();
        buffer.add_entry(LogEntry::new(LogLevel::Info, Some("image"), "building"));
        buffer.add_entry(LogEntry::new(LogLevel::Error, None, "failed"));

        let entries = buffer.drain();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action_id.as_deref(), Some("image"));
        assert!(buffer.drain().is_empty());
    }
}
