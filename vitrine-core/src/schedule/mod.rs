//! Schedule-driven rescans: time triggers that emit scan requests, with
//! coalescing against already-running jobs and a short firing lease so
//! multiple scheduler instances never double-fire.

pub mod lease;

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use vitrine_model::ids::{CollectionId, JobId, LibraryId};
use vitrine_model::job::JobKind;
use vitrine_model::schedule::{
    ScheduleOutcome, ScheduleType, ScheduledJob, ScheduledJobRun,
};

use crate::config::SchedulerConfig;
use crate::coordinator::ScanCoordinator;
use crate::error::{CatalogError, Result};
use crate::ledger::JobLedger;
use crate::store::ScheduleStore;

pub use lease::{FiringLease, MemoryLease};

/// Parse a cron expression, accepting the five-field form by normalizing it
/// to the six-field (seconds-first) form.
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|err| {
        CatalogError::Validation(format!(
            "unparseable cron expression {expression:?}: {err}"
        ))
    })
}

/// Next due instant strictly after `after`. `None` means the trigger never
/// fires on its own again.
pub fn next_run_at(
    job: &ScheduledJob,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    if !job.enabled {
        return Ok(None);
    }
    match &job.schedule {
        ScheduleType::Cron { expression } => {
            Ok(parse_cron(expression)?.after(&after).next())
        }
        ScheduleType::Interval { every_seconds } => Ok(Some(
            after + chrono::Duration::seconds((*every_seconds).max(1) as i64),
        )),
        // Once triggers remain eligible until fired, even when the due time
        // already passed.
        ScheduleType::Once { at } => {
            Ok((job.run_count == 0).then_some(*at))
        }
        ScheduleType::Manual => Ok(None),
    }
}

fn lease_key(id: vitrine_model::ids::ScheduledJobId) -> String {
    format!("scheduler:{id}")
}

pub struct Scheduler {
    schedules: Arc<dyn ScheduleStore>,
    ledger: Arc<dyn JobLedger>,
    coordinator: ScanCoordinator,
    lease: Arc<dyn FiringLease>,
    config: SchedulerConfig,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(
        schedules: Arc<dyn ScheduleStore>,
        ledger: Arc<dyn JobLedger>,
        coordinator: ScanCoordinator,
        lease: Arc<dyn FiringLease>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            schedules,
            ledger,
            coordinator,
            lease,
            config,
        }
    }

    /// Prime `next_run_at` for enabled triggers that have none yet
    /// (startup, or newly created rows). Missed cron/interval slots are
    /// skipped, not caught up.
    pub async fn prime(&self) -> Result<()> {
        let now = Utc::now();
        for mut job in self.schedules.list_scheduled_jobs().await? {
            if !job.enabled || job.next_run_at.is_some() {
                continue;
            }
            match next_run_at(&job, now) {
                Ok(next) => {
                    job.next_run_at = next;
                    self.schedules.update_scheduled_job(&job).await?;
                }
                Err(err) => warn!(
                    target: "scheduler",
                    job = %job.id,
                    error = %err,
                    "skipping trigger with unparseable schedule"
                ),
            }
        }
        Ok(())
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Err(err) = self.prime().await {
            error!(target: "scheduler", error = %err, "failed to prime triggers");
        }
        let tick = Duration::from_millis(self.config.tick_interval_ms.max(100));
        loop {
            tokio::select! {
                _ = tokio::time::sleep(tick) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.tick_once(Utc::now()).await {
                error!(target: "scheduler", error = %err, "scheduler tick failed");
            }
        }
        debug!(target: "scheduler", "scheduler stopped");
    }

    /// Evaluate all triggers against `now`, firing the due ones.
    pub async fn tick_once(&self, now: DateTime<Utc>) -> Result<()> {
        for job in self.schedules.list_scheduled_jobs().await? {
            if !job.enabled {
                continue;
            }
            let due = job.next_run_at.is_some_and(|at| at <= now)
                || (job.next_run_at.is_none()
                    && matches!(job.schedule, ScheduleType::Once { at } if at <= now && job.run_count == 0));
            if !due {
                continue;
            }
            if let Err(err) = self.fire(job, now).await {
                warn!(
                    target: "scheduler",
                    error = %err,
                    "trigger firing failed"
                );
            }
        }
        Ok(())
    }

    async fn fire(&self, job: ScheduledJob, now: DateTime<Utc>) -> Result<()> {
        let ttl = Duration::from_millis(self.config.firing_lease_ttl_ms);
        if !self.lease.acquire(&lease_key(job.id), ttl).await? {
            // Another scheduler instance holds this trigger.
            return Ok(());
        }
        let result = self.fire_locked(job, now).await;
        // The lease is short-lived; release is best effort.
        result
    }

    async fn fire_locked(
        &self,
        stale: ScheduledJob,
        now: DateTime<Utc>,
    ) -> Result<()> {
        // Re-read under the lease: a sibling may have fired it already.
        let Some(mut job) = self.schedules.scheduled_job(stale.id).await?
        else {
            return Ok(());
        };
        let still_due = job.enabled
            && (job.next_run_at.is_some_and(|at| at <= now)
                || matches!(job.schedule, ScheduleType::Once { at } if at <= now && job.run_count == 0));
        if !still_due {
            return Ok(());
        }

        let (outcome, fired_job_id, detail) = self.emit(&job).await;
        job.last_run_at = Some(now);
        match outcome {
            ScheduleOutcome::Fired => job.run_count += 1,
            ScheduleOutcome::Coalesced => {
                job.run_count += 1;
                job.coalesced_runs += 1;
            }
            ScheduleOutcome::Failed => {}
        }
        job.next_run_at = next_run_at(&job, now)?;
        self.schedules.update_scheduled_job(&job).await?;
        self.schedules
            .record_scheduled_run(&ScheduledJobRun {
                scheduled_job_id: job.id,
                fired_at: now,
                outcome,
                job_id: fired_job_id,
                detail,
            })
            .await?;

        info!(
            target: "scheduler",
            trigger = %job.id,
            outcome = ?outcome,
            next = ?job.next_run_at,
            "trigger fired"
        );
        Ok(())
    }

    /// Emit the scan request, coalescing into an already-running job.
    async fn emit(
        &self,
        job: &ScheduledJob,
    ) -> (ScheduleOutcome, Option<JobId>, Option<String>) {
        match job.target_kind {
            JobKind::LibraryScan => {
                let Some(library_id) = job
                    .parameter_str("library_id")
                    .and_then(|raw| LibraryId::parse(raw).ok())
                else {
                    return (
                        ScheduleOutcome::Failed,
                        None,
                        Some("missing library_id parameter".to_string()),
                    );
                };
                if self.config.coalesce_duplicates
                    && let Ok(Some(running)) = self
                        .ledger
                        .find_active(
                            JobKind::LibraryScan,
                            Some(library_id),
                            None,
                        )
                        .await
                {
                    return (
                        ScheduleOutcome::Coalesced,
                        Some(running.id),
                        None,
                    );
                }
                match self
                    .coordinator
                    .begin_library_scan(library_id, false)
                    .await
                {
                    Ok(job_id) => {
                        (ScheduleOutcome::Fired, Some(job_id), None)
                    }
                    Err(err) => (
                        ScheduleOutcome::Failed,
                        None,
                        Some(err.to_string()),
                    ),
                }
            }
            JobKind::CollectionScan => {
                let Some(collection_id) = job
                    .parameter_str("collection_id")
                    .and_then(|raw| CollectionId::parse(raw).ok())
                else {
                    return (
                        ScheduleOutcome::Failed,
                        None,
                        Some("missing collection_id parameter".to_string()),
                    );
                };
                if self.config.coalesce_duplicates
                    && let Ok(Some(running)) = self
                        .ledger
                        .find_active(
                            JobKind::CollectionScan,
                            None,
                            Some(collection_id),
                        )
                        .await
                {
                    return (
                        ScheduleOutcome::Coalesced,
                        Some(running.id),
                        None,
                    );
                }
                match self
                    .coordinator
                    .begin_collection_scan(collection_id, false, None)
                    .await
                {
                    Ok(job_id) => {
                        (ScheduleOutcome::Fired, Some(job_id), None)
                    }
                    Err(err) => (
                        ScheduleOutcome::Failed,
                        None,
                        Some(err.to_string()),
                    ),
                }
            }
            other => (
                ScheduleOutcome::Failed,
                None,
                Some(format!("unsupported trigger target {other}")),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn trigger(schedule: ScheduleType) -> ScheduledJob {
        ScheduledJob::new("nightly", JobKind::LibraryScan, schedule)
    }

    #[test]
    fn five_field_cron_expressions_are_accepted() {
        assert!(parse_cron("0 3 * * *").is_ok());
        assert!(parse_cron("0 0 3 * * *").is_ok());
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn cron_next_run_skips_to_the_following_slot() {
        let job = trigger(ScheduleType::Cron {
            expression: "0 3 * * *".to_string(),
        });
        let after = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let next = next_run_at(&job, after).unwrap().unwrap();
        assert_eq!(
            next,
            Utc.with_ymd_and_hms(2026, 8, 2, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn interval_next_run_counts_from_now_not_the_missed_slot() {
        let job = trigger(ScheduleType::Interval { every_seconds: 600 });
        let now = Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap();
        let next = next_run_at(&job, now).unwrap().unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(600));
    }

    #[test]
    fn once_triggers_stay_eligible_until_fired() {
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap();
        let mut job = trigger(ScheduleType::Once { at });
        assert_eq!(next_run_at(&job, Utc::now()).unwrap(), Some(at));
        job.run_count = 1;
        assert_eq!(next_run_at(&job, Utc::now()).unwrap(), None);
    }

    #[test]
    fn disabled_triggers_never_have_a_next_run() {
        let mut job = trigger(ScheduleType::Interval { every_seconds: 60 });
        job.enabled = false;
        assert_eq!(next_run_at(&job, Utc::now()).unwrap(), None);
    }

    #[test]
    fn manual_triggers_never_fire_on_their_own() {
        let job = trigger(ScheduleType::Manual);
        assert_eq!(next_run_at(&job, Utc::now()).unwrap(), None);
    }
}
