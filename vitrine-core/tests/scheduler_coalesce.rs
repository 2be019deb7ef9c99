//! Scheduler firing, coalescing, and trigger bookkeeping.

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{TestPipeline, write_image};
use vitrine_core::config::SchedulerConfig;
use vitrine_core::schedule::{MemoryLease, Scheduler};
use vitrine_core::service::ScheduledJobSpec;
use vitrine_model::job::JobKind;
use vitrine_model::schedule::ScheduleType;

fn scheduler_for(pipeline: &TestPipeline) -> Scheduler {
    Scheduler::new(
        pipeline.catalog.schedules.clone(),
        pipeline.ledger.clone(),
        pipeline.coordinator.clone(),
        Arc::new(MemoryLease::new()),
        SchedulerConfig::default(),
    )
}

fn scan_spec(library_id: vitrine_model::ids::LibraryId) -> ScheduledJobSpec {
    let mut parameters = serde_json::Map::new();
    parameters.insert(
        "library_id".to_string(),
        serde_json::Value::String(library_id.to_string()),
    );
    ScheduledJobSpec {
        display_name: "nightly scan".to_string(),
        target_kind: JobKind::LibraryScan,
        schedule: ScheduleType::Interval { every_seconds: 3600 },
        enabled: true,
        parameters,
    }
}

#[tokio::test]
async fn a_due_trigger_fires_and_recomputes_its_next_run() {
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_image(&root.path().join("albumA/a.jpg"), 32, 32);

    // Paused: the fired scan stays queued, which is all this test needs.
    let pipeline = TestPipeline::start_paused(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let scheduler = scheduler_for(&pipeline);

    let trigger_id = pipeline
        .service
        .create_scheduled_job(scan_spec(library.id))
        .await
        .unwrap();
    // Make it due now.
    let mut trigger = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    trigger.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    pipeline
        .catalog
        .schedules
        .update_scheduled_job(&trigger)
        .await
        .unwrap();

    let now = Utc::now();
    scheduler.tick_once(now).await.unwrap();

    let fired = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired.run_count, 1);
    assert_eq!(fired.coalesced_runs, 0);
    assert_eq!(fired.last_run_at, Some(now));
    // Misfire policy: the next slot counts from now, not the missed slot.
    assert!(fired.next_run_at.unwrap() > now);

    let running = pipeline
        .ledger
        .find_active(JobKind::LibraryScan, Some(library.id), None)
        .await
        .unwrap();
    assert!(running.is_some(), "the firing created a scan job");

    pipeline.stop().await;
}

#[tokio::test]
async fn firing_coalesces_into_a_running_scan() {
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_image(&root.path().join("albumA/a.jpg"), 32, 32);

    let pipeline = TestPipeline::start_paused(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let scheduler = scheduler_for(&pipeline);

    // A scan is already pending when the trigger fires.
    let existing_job = pipeline
        .service
        .start_library_scan(library.id, false)
        .await
        .unwrap();

    let trigger_id = pipeline
        .service
        .create_scheduled_job(scan_spec(library.id))
        .await
        .unwrap();
    let mut trigger = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    trigger.next_run_at = Some(Utc::now() - chrono::Duration::seconds(1));
    pipeline
        .catalog
        .schedules
        .update_scheduled_job(&trigger)
        .await
        .unwrap();

    let now = Utc::now();
    scheduler.tick_once(now).await.unwrap();

    let after = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.coalesced_runs, 1);
    assert_eq!(after.last_run_at, Some(now));
    assert!(after.next_run_at.unwrap() > now);

    // No second job was created for the same library.
    let active = pipeline
        .ledger
        .find_active(JobKind::LibraryScan, Some(library.id), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, existing_job);

    pipeline.stop().await;
}

#[tokio::test]
async fn disabled_triggers_do_not_fire() {
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();

    let pipeline = TestPipeline::start_paused(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let scheduler = scheduler_for(&pipeline);

    let trigger_id = pipeline
        .service
        .create_scheduled_job(scan_spec(library.id))
        .await
        .unwrap();
    pipeline
        .service
        .disable_scheduled_job(trigger_id)
        .await
        .unwrap();

    let disabled = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    assert!(disabled.next_run_at.is_none());

    scheduler.tick_once(Utc::now()).await.unwrap();
    let after = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.run_count, 0);

    pipeline.stop().await;
}

#[tokio::test]
async fn once_triggers_fire_exactly_once() {
    let root = tempfile::tempdir().unwrap();
    let cache = tempfile::tempdir().unwrap();
    write_image(&root.path().join("albumA/a.jpg"), 32, 32);

    let pipeline = TestPipeline::start_paused(root.path(), cache.path()).await;
    let library = pipeline.library().await;
    let scheduler = scheduler_for(&pipeline);

    let mut spec = scan_spec(library.id);
    // Due in the past: Once stays eligible until fired.
    spec.schedule = ScheduleType::Once {
        at: Utc::now() - chrono::Duration::hours(1),
    };
    let trigger_id =
        pipeline.service.create_scheduled_job(spec).await.unwrap();

    scheduler.tick_once(Utc::now()).await.unwrap();
    scheduler.tick_once(Utc::now()).await.unwrap();

    let after = pipeline
        .catalog
        .schedules
        .scheduled_job(trigger_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after.run_count, 1);
    assert!(after.next_run_at.is_none());

    pipeline.stop().await;
}
