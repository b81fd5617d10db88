//! Background task that reaps expired artifacts.

use std::sync::Arc;

use serde_json::json;
use tokio::time::{Duration, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    event_log::{Event, EventSink, EventType},
    store::{ArtifactStore, SweepReport},
};

pub struct Sweeper {
    store: Arc<ArtifactStore>,
    events: Arc<dyn EventSink>,
    max_age: Duration,
    interval: Duration,
}

impl Sweeper {
    /// `interval` is clamped to `max_age`: a coarser period would let artifacts outlive the
    /// retention window.
    pub fn new(
        store: Arc<ArtifactStore>,
        events: Arc<dyn EventSink>,
        max_age: Duration,
        interval: Duration,
    ) -> Self {
        let interval = if interval.is_zero() || interval > max_age {
            if interval > max_age {
                warn!(
                    "Intervalo de limpieza {:?} mayor que la retencion {:?}; se usara la retencion.",
                    interval, max_age
                );
            }
            max_age
        } else {
            interval
        };

        Self {
            store,
            events,
            max_age,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Runs a single sweep and records one event per removed file and per failure.
    pub async fn run_once(&self) -> SweepReport {
        let report = self.store.sweep(self.max_age).await;
        self.record(&report).await;
        report
    }

    /// Sweeps immediately, then once per interval, until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Limpieza de descargas activa: retencion {}s, intervalo {}s",
            self.max_age.as_secs(),
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Limpieza de descargas detenida");
                    break;
                }
                _ = ticker.tick() => {
                    self.run_once().await;
                }
            }
        }
    }

    async fn record(&self, report: &SweepReport) {
        for path in &report.removed_files {
            let filename = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.events
                .record(Event::success(EventType::FileCleanup).details(json!({ "filename": filename })))
                .await;
        }

        for failure in &report.failures {
            self.events
                .record(Event::error(
                    EventType::FileCleanup,
                    format!("Error removing {}: {}", failure.path.display(), failure.message),
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventStatus;
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    #[async_trait]
    impl EventSink for RecordingSink {
        async fn record(&self, event: Event) {
            self.events.lock().await.push(event);
        }
    }

    async fn setup(
        max_age: Duration,
    ) -> (Sweeper, Arc<ArtifactStore>, Arc<RecordingSink>, tempfile::TempDir) {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(temp.path().join("downloads")).await.unwrap());
        let sink = Arc::new(RecordingSink::default());
        let sweeper = Sweeper::new(store.clone(), sink.clone(), max_age, max_age);
        (sweeper, store, sink, temp)
    }

    #[tokio::test]
    async fn interval_never_exceeds_retention() {
        let temp = tempfile::tempdir().unwrap();
        let store = Arc::new(ArtifactStore::open(temp.path()).await.unwrap());
        let sink: Arc<dyn EventSink> = Arc::new(RecordingSink::default());

        let coarse = Sweeper::new(
            store.clone(),
            sink.clone(),
            Duration::from_secs(60),
            Duration::from_secs(3600),
        );
        assert_eq!(coarse.interval(), Duration::from_secs(60));

        let fine = Sweeper::new(store, sink, Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(fine.interval(), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn run_once_records_cleanup_events() {
        let (sweeper, store, sink, _temp) = setup(Duration::from_millis(1)).await;
        let allocation = store.allocate().await.unwrap();
        tokio::fs::write(allocation.dir.join("clip.mp4"), "video")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = sweeper.run_once().await;

        assert_eq!(report.removed_files.len(), 1);
        let events = sink.events.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::FileCleanup);
        assert_eq!(events[0].status, EventStatus::Success);
        assert_eq!(events[0].details, Some(json!({ "filename": "clip.mp4" })));
    }

    #[tokio::test]
    async fn run_stops_when_cancelled() {
        let (sweeper, _store, _sink, _temp) = setup(Duration::from_secs(3600)).await;
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(sweeper.run(shutdown.clone()));
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper should stop after cancellation")
            .unwrap();
    }
}
