use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{JobId, ScheduledJobId};
use crate::job::JobKind;

/// How a scheduled job decides its next firing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleType {
    /// Cron expression evaluated in UTC. Five-field expressions are accepted
    /// and normalized by the scheduler.
    Cron { expression: String },
    /// Fixed interval from the previous run.
    Interval { every_seconds: u64 },
    /// Fires once at the given instant; remains eligible until fired.
    Once { at: DateTime<Utc> },
    /// Never fires on its own.
    Manual,
}

/// A time-triggered control-plane action that emits scan requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: ScheduledJobId,
    pub display_name: String,
    pub target_kind: JobKind,
    pub schedule: ScheduleType,
    pub enabled: bool,
    pub run_count: u64,
    /// Firings skipped because an equivalent job was already running.
    pub coalesced_runs: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub parameters: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(
        display_name: impl Into<String>,
        target_kind: JobKind,
        schedule: ScheduleType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ScheduledJobId::new(),
            display_name: display_name.into(),
            target_kind,
            schedule,
            enabled: true,
            run_count: 0,
            coalesced_runs: 0,
            last_run_at: None,
            next_run_at: None,
            parameters: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

/// Outcome of one firing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleOutcome {
    Fired,
    Coalesced,
    Failed,
}

/// History row recorded for every firing attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJobRun {
    pub scheduled_job_id: ScheduledJobId,
    pub fired_at: DateTime<Utc>,
    pub outcome: ScheduleOutcome,
    /// Job created by the firing, or the running job it coalesced into.
    pub job_id: Option<JobId>,
    pub detail: Option<String>,
}
