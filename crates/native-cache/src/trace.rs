//! Loader trace events.
//!
//! Emitted only when `LoaderConfig::trace_enabled` is set. They never change
//! what the loader does.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceKind {
    Canonical,
    RelocationSkipped,
    CacheHit,
    CacheInstalled,
    CacheFailed,
    Decrypted,
    DecryptFailed,
    ScratchRemoved,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceEvent {
    pub kind: TraceKind,
    pub module: String,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl TraceEvent {
    pub fn new(kind: TraceKind, module: &str, path: Option<&Path>, message: impl Into<String>) -> Self {
        Self {
            kind,
            module: module.to_string(),
            path: path.map(Path::to_path_buf),
            message: message.into(),
        }
    }
}

pub trait TraceSink: Send + Sync {
    fn emit(&self, event: TraceEvent);
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TraceSink for TracingSink {
    fn emit(&self, event: TraceEvent) {
        match &event.path {
            Some(path) => tracing::debug!(
                module = %event.module,
                kind = ?event.kind,
                path = %path.display(),
                "{}",
                event.message
            ),
            None => tracing::debug!(module = %event.module, kind = ?event.kind, "{}", event.message),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TraceEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<TraceKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl TraceSink for RecordingSink {
    fn emit(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}
