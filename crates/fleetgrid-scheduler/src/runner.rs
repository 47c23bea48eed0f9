//! Periodic scheduling runner.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info};

use fleet_core::SchedulerConfig;

use crate::error::SchedulerResult;
use crate::scheduler::{ScheduleReport, Scheduler};

pub struct Runner {
    scheduler: Scheduler,
    config: SchedulerConfig,
}

impl Runner {
    pub fn new(scheduler: Scheduler, config: SchedulerConfig) -> Self {
        Self { scheduler, config }
    }

    /// Run one scheduling pass unless scheduling is disabled.
    ///
    /// Returns `None` when disabled. Per-distro failures surface as the
    /// aggregated `Distros` error.
    pub async fn run_once(
        &self,
        cancel: &watch::Receiver<bool>,
    ) -> SchedulerResult<Option<ScheduleReport>> {
        if self.config.disabled {
            info!("scheduler disabled, skipping run");
            return Ok(None);
        }

        let started = Instant::now();
        info!("starting scheduling run");
        let result = self
            .scheduler
            .schedule(cancel)
            .await
            .and_then(ScheduleReport::into_result);
        let runtime_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(report) => info!(
                runtime_ms,
                queued = report.total_queue_size(),
                intents = report.total_intents(),
                "scheduling run succeeded"
            ),
            Err(e) => error!(runtime_ms, error = %e, "scheduling run failed"),
        }
        result.map(Some)
    }

    /// Run passes every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "scheduler runner started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once(&shutdown).await {
                        debug!(error = %e, "retrying on next tick");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scheduler runner shutting down");
                    break;
                }
            }
        }
    }
}
