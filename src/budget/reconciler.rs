use super::guard::lifetime_exclusion;
use crate::cache::CandidateCache;
use crate::models::{AdStatus, CampaignStatus};
use crate::stats::StatisticsRecorder;
use crate::storage::Storage;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub ads_completed: usize,
    pub campaigns_completed: usize,
    pub pending_applied: usize,
}

/// Background pass that retires exhausted ads and campaigns and replays
/// buffered recordings.
///
/// Idempotent: completing an already completed ad is a no-op, so several
/// instances may run it at once.
pub struct BudgetReconciler {
    storage: Arc<dyn Storage>,
    cache: CandidateCache,
    recorder: Arc<StatisticsRecorder>,
}

impl BudgetReconciler {
    pub fn new(
        storage: Arc<dyn Storage>,
        cache: CandidateCache,
        recorder: Arc<StatisticsRecorder>,
    ) -> Self {
        Self {
            storage,
            cache,
            recorder,
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();

        match self.recorder.flush_pending().await {
            Ok(applied) => report.pending_applied = applied,
            Err(e) => tracing::error!("Failed to replay pending recordings: {}", e),
        }

        for ad in self.storage.list_ads_by_status(AdStatus::Active).await? {
            let exhausted = lifetime_exclusion(&ad);
            if exhausted.is_none() && !ad.is_past_end(now) {
                continue;
            }
            if self.storage.complete_ad(ad.id).await? {
                tracing::info!(ad_id = ad.id, reason = ?exhausted, "ad completed");
                self.recorder.forget_ad(ad.id).await;
                report.ads_completed += 1;
            }
        }

        for campaign in self
            .storage
            .list_campaigns_by_status(CampaignStatus::Active)
            .await?
        {
            let past_end = campaign.end_date.is_some_and(|end| now > end);
            if !campaign.is_budget_exhausted() && !past_end {
                continue;
            }
            if self.storage.complete_campaign(campaign.id).await? {
                tracing::info!(campaign_id = campaign.id, "campaign completed");
                report.campaigns_completed += 1;
            }
        }

        if report.ads_completed > 0 || report.campaigns_completed > 0 {
            self.cache.invalidate_all();
        }

        Ok(report)
    }

    /// Run `run_once` every `interval` until the returned handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> ReconcilerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut interval = time::interval(interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.run_once(Utc::now()).await {
                            tracing::error!("Budget reconciliation failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Shutdown signal received, flushing pending recordings...");
                            match self.recorder.flush_pending().await {
                                Ok(applied) => {
                                    tracing::info!("Flushed {} pending recordings on shutdown", applied)
                                }
                                Err(e) => {
                                    tracing::error!("Failed to flush pending recordings on shutdown: {}", e)
                                }
                            }
                            break;
                        }
                    }
                }
            }
        });

        ReconcilerHandle { shutdown_tx, task }
    }
}

pub struct ReconcilerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ReconcilerHandle {
    /// Signal shutdown and wait for the final flush.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            tracing::error!("Reconciler task ended abnormally: {}", e);
        }
    }
}
