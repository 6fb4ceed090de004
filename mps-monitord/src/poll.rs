use std::time::Duration;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use crate::cache::hash;
use crate::record::{RecordStatus, RefreshReport};
use crate::registry::RegistryHandle;

/// "Repaint": published once per completed poll pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ViewSignal {
    pub sequence: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub digest: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    /// 1 refreshes records one after another
    pub max_concurrent: usize,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_concurrent: 1,
        }
    }
}

pub struct PollCoordinator {
    registry: RegistryHandle,
    settings: PollSettings,
    view_tx: watch::Sender<ViewSignal>,
    sequence: u64,
}

impl PollCoordinator {
    pub fn new(registry: RegistryHandle, settings: PollSettings) -> (Self, watch::Receiver<ViewSignal>) {
        let (view_tx, view_rx) = watch::channel(ViewSignal::default());
        let coordinator = Self {
            registry,
            settings,
            view_tx,
            sequence: 0,
        };
        (coordinator, view_rx)
    }

    /// Refresh every registered record once, then publish a view signal.
    pub async fn tick(&mut self) -> ViewSignal {
        let snapshot = self.registry.snapshot();

        let reports: Vec<RefreshReport> = stream::iter(snapshot.iter().cloned())
            .map(|record| async move { record.refresh().await })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;

        let statuses: Vec<RecordStatus> = snapshot.iter().map(|r| r.status()).collect();
        let digest = match hash::compute_digest(&statuses) {
            Ok(digest) => digest,
            Err(e) => {
                tracing::error!("Failed to compute view digest: {}", e);
                self.view_tx.borrow().digest.clone()
            }
        };

        self.sequence += 1;
        let signal = ViewSignal {
            sequence: self.sequence,
            completed_at: Some(Utc::now()),
            digest,
        };
        let uninitialized = reports.iter().filter(|r| !r.initialized).count();
        let oracle_failures: usize = reports.iter().map(|r| r.oracle_failures).sum();
        let refetched: usize = reports.iter().map(|r| r.facets_refetched).sum();
        let facet_failures: usize = reports.iter().map(|r| r.facet_failures).sum();
        tracing::debug!(
            "Poll pass {} over {} portals: {} uninitialized, {} oracle failures, {} refetched ({} failed)",
            signal.sequence,
            snapshot.len(),
            uninitialized,
            oracle_failures,
            refetched,
            facet_failures
        );
        self.view_tx.send_replace(signal.clone());
        signal
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!("Polling portals every {:?}", self.settings.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick().await;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Poll coordinator shutting down");
                    break;
                }
            }
        }
    }
}
