use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::service::CacheService;
use crate::SyncConfig;

/// Builds the trailing-window refresh job, or `None` when the scheduler is off.
///
/// The returned scheduler is not started.
pub async fn maybe_build_scheduler(
    config: &SyncConfig,
    service: Arc<CacheService>,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let window_days = config.refresh_window_days;
    let cron = config.refresh_cron.as_str();
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = Arc::clone(&service);
        Box::pin(async move {
            let today = Utc::now().date_naive();
            let results = service.refresh_trailing_window(window_days, today).await;
            let failed = results.iter().filter(|r| r.error.is_some()).count();
            if failed > 0 {
                warn!(failed, sources = results.len(), "scheduled refresh finished with errors");
            } else {
                info!(sources = results.len(), "scheduled refresh finished");
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
