//! Where publish attempts are recorded.

use crate::credentials::SubjectId;
use crate::error::TikTokError;
use eyre::Context;
use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;

/// Platform name stamped on every record this crate writes.
pub const PLATFORM: &str = "tiktok";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PostStatus {
    Posted,
    Failed,
}

/// One publish attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishRecord {
    pub filename: String,
    pub status: PostStatus,
    pub platform: String,
    /// The outcome as JSON on success, the error text on failure.
    pub response: String,
    pub subject: Option<SubjectId>,
    pub recorded_at: Timestamp,
}

impl PublishRecord {
    pub fn new(
        filename: impl Into<String>,
        status: PostStatus,
        response: impl Into<String>,
        subject: Option<SubjectId>,
    ) -> Self {
        Self {
            filename: filename.into(),
            status,
            platform: PLATFORM.to_string(),
            response: response.into(),
            subject,
            recorded_at: Timestamp::now(),
        }
    }
}

/// An append-only sink for [`PublishRecord`]s.
pub trait PublishLog: Send + Sync {
    fn record(&self, record: PublishRecord)
    -> impl Future<Output = Result<(), TikTokError>> + Send;
}

#[derive(Debug, Default)]
pub struct MemoryPublishLog {
    records: Mutex<Vec<PublishRecord>>,
}

impl MemoryPublishLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A snapshot of everything recorded so far, oldest first.
    pub fn records(&self) -> Vec<PublishRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PublishLog for MemoryPublishLog {
    async fn record(&self, record: PublishRecord) -> Result<(), TikTokError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }
}

/// Appends one JSON object per line to a file.
///
/// Appends are serialized so concurrent publishes never interleave partial lines.
#[derive(Debug)]
pub struct JsonLinesPublishLog {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonLinesPublishLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PublishLog for JsonLinesPublishLog {
    async fn record(&self, record: PublishRecord) -> Result<(), TikTokError> {
        let mut line = serde_json::to_vec(&record).context("serialize publish record")?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open publish log {}", self.path.display()))?;
        file.write_all(&line)
            .await
            .with_context(|| format!("append to publish log {}", self.path.display()))?;
        file.flush().await.context("flush publish log")?;
        Ok(())
    }
}
