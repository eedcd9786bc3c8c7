//! Periodic history rollup: application and container totals plus per
//! partition node utilization.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::export::health::HealthMetrics;
use crate::repository::Repository;
use crate::yunikorn::SchedulerClient;

/// Samples written by one rollup.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollupSummary {
    pub history: usize,
    pub utilizations: usize,
}

pub struct HistoryRollup<C> {
    client: Arc<C>,
    repo: Arc<dyn Repository>,
    metrics: Option<Arc<HealthMetrics>>,
    interval: Duration,
}

impl<C: SchedulerClient + 'static> HistoryRollup<C> {
    pub fn new(client: Arc<C>, repo: Arc<dyn Repository>, interval: Duration) -> Self {
        Self {
            client,
            repo,
            metrics: None,
            interval,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Reads the scheduler history endpoints once and stores the samples.
    pub async fn run_once(&self) -> Result<RollupSummary> {
        let mut entries = self
            .client
            .get_application_history()
            .await
            .context("fetching application history")?;
        entries.extend(
            self.client
                .get_container_history()
                .await
                .context("fetching container history")?,
        );

        let start = Instant::now();
        let result = self.repo.record_history(&entries).await;
        self.observe("record_history", result.is_ok(), start);
        result.context("recording history")?;

        let utilizations = self
            .client
            .get_node_utilizations()
            .await
            .context("fetching node utilizations")?;

        let start = Instant::now();
        let result = self.repo.upsert_node_utilizations(&utilizations).await;
        self.observe("upsert_node_utilizations", result.is_ok(), start);
        result.context("upserting node utilizations")?;

        if let Some(m) = &self.metrics {
            m.history_rollups.inc();
        }

        Ok(RollupSummary {
            history: entries.len(),
            utilizations: utilizations.len(),
        })
    }

    fn observe(&self, op: &str, ok: bool, start: Instant) {
        if let Some(m) = &self.metrics {
            m.record_repository_op(op, ok, start.elapsed());
        }
    }

    /// Runs a rollup every interval until cancelled. Failures are logged and
    /// retried on the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(summary) => {
                            debug!(
                                history = summary.history,
                                utilizations = summary.utilizations,
                                "history rollup stored"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "history rollup failed");
                        }
                    }
                }
            }
        }
    }
}
