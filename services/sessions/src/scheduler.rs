//! Cron triggers for the reconciliation passes

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::reconciler::{Pass, PassOutcome, Reconciler};

/// Register one job per pass on its configured schedule and start the scheduler
///
/// Jobs only trigger passes; a trigger that lands while the same pass is
/// still running is skipped by the reconciler.
pub async fn start_reconciliation(reconciler: Reconciler) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await?;

    for pass in Pass::ALL {
        let schedule = reconciler.config().schedule(pass).to_string();
        let job_reconciler = reconciler.clone();

        let job = Job::new_async(schedule.as_str(), move |_, _| {
            let reconciler = job_reconciler.clone();
            Box::pin(async move {
                info!(pass = %pass, "Reconciliation job executed");
                if let PassOutcome::Aborted(reason) = reconciler.run(pass).await {
                    error!(pass = %pass, "Reconciliation job failed: {}", reason);
                }
            })
        })?;

        scheduler.add(job).await?;
        info!("Scheduled {} with schedule: {}", pass, schedule);
    }

    scheduler.start().await?;
    info!("Started reconciliation scheduler");
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ReconcilerConfig;
    use crate::store::{MemoryEphemeralStore, MemoryRecordStore};
    use std::sync::Arc;

    fn reconciler(config: ReconcilerConfig) -> Reconciler {
        let clock = Arc::new(SystemClock);
        Reconciler::new(
            Arc::new(MemoryEphemeralStore::new(clock.clone())),
            Arc::new(MemoryRecordStore::new()),
            clock,
            config,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_default_schedules_are_accepted() {
        let mut scheduler = start_reconciliation(reconciler(ReconcilerConfig::default()))
            .await
            .unwrap();
        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_invalid_schedule_is_rejected() {
        let config = ReconcilerConfig {
            archival_schedule: "every sunday".to_string(),
            ..ReconcilerConfig::default()
        };

        assert!(start_reconciliation(reconciler(config)).await.is_err());
    }
}
