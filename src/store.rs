//! Durable transcript store boundary.
//!
//! Persistence is append-only and strictly best-effort: the pipeline never
//! waits on a write and a failed write only produces a log line.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tracing::warn;

use crate::error::Result;

/// One append-only transcript record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptRecord {
    pub session_id: String,
    pub user_name: String,
    pub original_text: String,
    pub translated_text: String,
    pub language_pair: String,
    pub is_final: bool,
}

/// External durable store.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    async fn save(&self, record: TranscriptRecord) -> Result<()>;
}

/// Fire-and-forget persistence: spawn the write and log any failure.
pub fn persist_best_effort(store: Arc<dyn TranscriptStore>, record: TranscriptRecord) {
    tokio::spawn(async move {
        if let Err(e) = store.save(record).await {
            warn!(error = %e, "transcript persistence failed");
        }
    });
}

/// Store that drops every record (persistence disabled).
pub struct NoopStore;

#[async_trait]
impl TranscriptStore for NoopStore {
    async fn save(&self, _record: TranscriptRecord) -> Result<()> {
        Ok(())
    }
}

/// In-memory store, useful in tests and demos.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<TranscriptRecord>>,
    fail: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose writes always fail, for error-path tests.
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn records(&self) -> Vec<TranscriptRecord> {
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TranscriptStore for MemoryStore {
    async fn save(&self, record: TranscriptRecord) -> Result<()> {
        if self.fail {
            return Err(crate::error::EngineError::Persistence {
                message: "store unavailable".to_string(),
            });
        }
        self.records
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}
