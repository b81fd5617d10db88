//! Append-only audit log of service operations.
//!
//! Recording is best-effort: failures are reported through `tracing` and never reach the
//! request that triggered them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ApplicationStart,
    InfoRequest,
    DownloadRequest,
    Mp3Conversion,
    FileAccess,
    FileCleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub url: Option<String>,
    pub ip: Option<String>,
    pub status: EventStatus,
    pub details: Option<serde_json::Value>,
}

impl Event {
    pub fn success(event_type: EventType) -> Self {
        Self {
            event_type,
            url: None,
            ip: None,
            status: EventStatus::Success,
            details: None,
        }
    }

    pub fn error(event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            status: EventStatus::Error,
            details: Some(serde_json::Value::String(message.into())),
            ..Self::success(event_type)
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn record(&self, event: Event);
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

/// JSON-lines file, one [`EventRecord`] per line.
pub struct JsonlEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: &EventRecord) -> std::io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await
    }
}

#[async_trait]
impl EventSink for JsonlEventLog {
    async fn record(&self, event: Event) {
        let record = EventRecord {
            timestamp: Utc::now(),
            event,
        };

        if let Err(error) = self.append(&record).await {
            warn!("No se pudo registrar el evento {:?}: {error}", record.event.event_type);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn appends_one_json_line_per_event() {
        let temp = tempfile::tempdir().unwrap();
        let log = JsonlEventLog::new(temp.path().join("data").join("events.jsonl"));

        log.record(
            Event::success(EventType::InfoRequest)
                .url("https://youtu.be/abc")
                .ip("127.0.0.1")
                .details(json!({"video_id": "abc", "stream_count": 3})),
        )
        .await;
        log.record(Event::error(EventType::FileAccess, "File not found"))
            .await;

        let contents = tokio::fs::read_to_string(log.path()).await.unwrap();
        let records: Vec<EventRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.event_type, EventType::InfoRequest);
        assert_eq!(records[0].event.details, Some(json!({"video_id": "abc", "stream_count": 3})));
        assert_eq!(records[1].event.status, EventStatus::Error);
        assert_eq!(records[1].event.details, Some(json!("File not found")));
    }

    #[tokio::test]
    async fn write_failures_are_swallowed() {
        let temp = tempfile::tempdir().unwrap();
        // A directory cannot be opened for appending.
        let log = JsonlEventLog::new(temp.path());

        log.record(Event::success(EventType::ApplicationStart)).await;
    }

    #[test]
    fn event_types_serialize_in_snake_case() {
        let value = serde_json::to_value(EventType::Mp3Conversion).unwrap();
        assert_eq!(value, "mp3_conversion");
    }
}
