//! Ambient logging stack. See SPEC_FULL §4.10.
//!
//! Two halves: `init_tracing` sets up the process-wide human-facing sink;
//! `LogStore` is the bounded ring buffer the helper thread's MPSC drain
//! feeds, backing the control-plane `tail_logs` command.
//!
//! Ground: teacher `logging.rs`'s `VecDeque`-backed ring buffer (kept,
//! capacity and eviction policy unchanged) with the `println!` sink
//! replaced by `tracing`/`tracing-subscriber`, matching how
//! `jitlabs-sg-mihomo-rust` logs throughout its stack.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use pegas_shared::LogRecord;
use tracing_subscriber::EnvFilter;

const MAX_LOG_ENTRIES: usize = 1000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Initializes the global `tracing` subscriber. Called once from `main`.
pub fn init_tracing(log_level: &str, isatty: bool) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(isatty)
        .with_target(false)
        .init();
}

/// Bounded ring buffer backing `tail_logs`, fed from the log MPSC queue.
pub struct LogStore {
    entries: RwLock<VecDeque<LogRecord>>,
}

impl LogStore {
    pub fn new() -> Self {
        LogStore {
            entries: RwLock::new(VecDeque::with_capacity(MAX_LOG_ENTRIES)),
        }
    }

    pub fn push(&self, record: LogRecord) {
        let mut entries = self.entries.write();
        if entries.len() >= MAX_LOG_ENTRIES {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    pub fn tail(&self, count: usize) -> Vec<LogRecord> {
        let entries = self.entries.read();
        let start = entries.len().saturating_sub(count);
        entries.iter().skip(start).cloned().collect()
    }

    pub fn all(&self) -> Vec<LogRecord> {
        self.entries.read().iter().cloned().collect()
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedLogStore = Arc<LogStore>;

/// Builds a `LogRecord` and emits the matching `tracing` event. Sessions
/// call this instead of `tracing::info!` directly so the MPSC queue leg
/// (crossing the worker→helper thread boundary) is never forgotten.
pub fn record(level: pegas_shared::LogLevel, text: impl Into<String>) -> LogRecord {
    let text = text.into();
    match level {
        pegas_shared::LogLevel::Error => tracing::error!("{text}"),
        pegas_shared::LogLevel::Warn => tracing::warn!("{text}"),
        pegas_shared::LogLevel::Info => tracing::info!("{text}"),
        pegas_shared::LogLevel::Debug => tracing::debug!("{text}"),
    }
    LogRecord {
        level: level.as_str().to_string(),
        text,
        at_ms: now_ms(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_past_capacity() {
        let store = LogStore::new();
        for i in 0..(MAX_LOG_ENTRIES + 10) {
            store.push(LogRecord {
                level: "info".into(),
                text: format!("msg {i}"),
                at_ms: i as u64,
            });
        }
        assert_eq!(store.all().len(), MAX_LOG_ENTRIES);
        assert_eq!(store.all()[0].text, "msg 10");
    }
}
