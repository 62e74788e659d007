//! Periodic remote secret rotation
//!
//! Tokens minted for remote secrets expire, so every member cluster's secret
//! is rebuilt on a fixed interval regardless of whether anything changed.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::controller::Context;
use crate::remote_secret::{CreateOptions, SecretOutcome};
use crate::Result;

/// Counts from one rotation cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RotationReport {
    /// Member clusters considered
    pub total: usize,
    /// Clusters whose secret was rebuilt
    pub successful: usize,
    /// Unready clusters that have no secret to rebuild yet
    pub skipped: usize,
    /// Clusters whose rebuild failed
    pub failed: usize,
}

/// Rebuilds every member cluster's remote secret on `rotation_interval`.
pub struct RotationScheduler {
    ctx: Arc<Context>,
}

impl RotationScheduler {
    /// Create a scheduler sharing the reconciler's context
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Rotate on every tick until `cancel` fires. The first cycle runs one
    /// full interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        let period = self.ctx.config.rotation_interval;
        info!(interval = ?period, "Starting remote secret rotation");

        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.rotate_once(&cancel).await {
                warn!(error = %e, "Rotation cycle failed");
            }
        }
        info!("Remote secret rotation stopped");
    }

    /// One rotation cycle over all member clusters.
    ///
    /// Failures for individual clusters are logged and counted; only a
    /// failure to list clusters is returned.
    #[instrument(skip_all)]
    pub async fn rotate_once(&self, cancel: &CancellationToken) -> Result<RotationReport> {
        let config = &self.ctx.config;
        let clusters = self
            .ctx
            .api
            .list_clusters_with_label(&config.role_label)
            .await?;

        let mut report = RotationReport::default();
        for cd in clusters.iter().filter(|cd| cd.is_mesh_member(config)) {
            if cancel.is_cancelled() {
                info!("Rotation interrupted by shutdown");
                break;
            }
            report.total += 1;
            match self
                .ctx
                .remote_secrets
                .try_create(
                    cd,
                    CreateOptions {
                        allow_overwrite: true,
                    },
                )
                .await
            {
                Ok(SecretOutcome::NotReady) => report.skipped += 1,
                Ok(_) => report.successful += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(cluster = %cd.key(), error = %e, "Failed to rotate remote secret");
                }
            }
        }

        info!(
            total = report.total,
            successful = report.successful,
            skipped = report.skipped,
            failed = report.failed,
            "Rotation cycle finished"
        );
        Ok(report)
    }
}
