//! Status reporting, heartbeats and liveness sweeps over the in-memory store.

mod common;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

use common::{broker, seed, MockIssuer};
use grid_broker::broker::{MatchOutcome, MatchRequest};
use grid_broker::job::{Job, JobOwner, JobStatus, TransitionActor, WaitingAggregate};
use grid_broker::liveness::{LivenessMonitor, LivenessSettings, SweepReport};
use grid_broker::storage::{MemoryTaskQueueStore, StatusChange, StatusUpdate, TaskQueueStore};

async fn assigned_job(store: &Arc<MemoryTaskQueueStore>, queue_id: i64) -> (i64, i32) {
    seed(store, WaitingAggregate::new(queue_id, "alice", queue_id), queue_id, 1).await;
    let request = MatchRequest::new("ALICE::CERN::LCG", "CERN", "wn001", 86_400).with_disk(1_000_000);
    match broker(store, MockIssuer::ok()).match_job(&request).await.unwrap() {
        MatchOutcome::Assigned(job) => (job.queue_id, job.resubmission),
        other => panic!("unexpected {:?}", other),
    }
}

fn agent(queue_id: i64, resubmission: i32, status: JobStatus) -> StatusChange {
    StatusChange::new(queue_id, resubmission, status, TransitionActor::Agent)
}

#[tokio::test]
async fn test_agent_drives_job_to_done() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let (qid, resub) = assigned_job(&store, 10).await;

    for status in [JobStatus::Started, JobStatus::Running, JobStatus::Saving, JobStatus::Done] {
        let update = store.update_job_status(&agent(qid, resub, status)).await.unwrap();
        assert!(update.is_applied(), "{} was not applied: {:?}", status, update);
    }

    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Done);
}

#[tokio::test]
async fn test_stale_report_changes_nothing() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let (qid, resub) = assigned_job(&store, 11).await;
    store
        .update_job_status(&agent(qid, resub, JobStatus::Started))
        .await
        .unwrap();

    let pinned: DateTime<Utc> = Utc::now() - Duration::minutes(5);
    store.set_heartbeat(qid, pinned).await.unwrap();
    let before = store.job(qid).await.unwrap();

    let update = store
        .update_job_status(&agent(qid, resub - 1, JobStatus::Running))
        .await
        .unwrap();
    assert_eq!(
        update,
        StatusUpdate::Stale {
            current_resubmission: resub
        }
    );
    assert!(!store.touch_heartbeat(qid, resub - 1).await.unwrap());

    let after = store.job(qid).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.last_heartbeat, Some(pinned));
}

#[tokio::test]
async fn test_terminal_jobs_do_not_move() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    store
        .insert_job(
            Job::new(12, JobOwner::new("alice", "submit01"), "jdl")
                .with_status(JobStatus::Done)
                .with_heartbeat(Utc::now() - Duration::hours(10)),
        )
        .await;

    for status in JobStatus::ALL {
        for actor in [TransitionActor::Agent, TransitionActor::Monitor, TransitionActor::Broker] {
            let change = StatusChange::new(12, 0, status, actor);
            let update = store.update_job_status(&change).await.unwrap();
            assert!(!update.is_applied(), "{:?} moved DONE to {}", actor, status);
        }
    }

    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "test");
    assert_eq!(monitor.sweep(Utc::now()).await.unwrap().moved(), 0);
    assert_eq!(store.job(12).await.unwrap().status, JobStatus::Done);
}

#[tokio::test]
async fn test_silent_job_becomes_zombie_then_expired() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let now = Utc::now();
    store
        .insert_job(
            Job::new(13, JobOwner::new("alice", "submit01"), "jdl")
                .with_status(JobStatus::Running)
                .with_heartbeat(now - Duration::minutes(61)),
        )
        .await;
    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "test");

    let report = monitor.run_cycle_at(now).await.unwrap();
    assert_eq!(report.moved(), 1);
    assert_eq!(store.job(13).await.unwrap().status, JobStatus::Zombie);

    // Immediately sweeping again finds nothing new.
    assert_eq!(monitor.sweep(now).await.unwrap().moved(), 0);

    // Still within the expiry window.
    monitor.sweep(now + Duration::minutes(100)).await.unwrap();
    assert_eq!(store.job(13).await.unwrap().status, JobStatus::Zombie);

    let report = monitor.run_cycle_at(now + Duration::minutes(181)).await.unwrap();
    assert_eq!(report.moved(), 1);
    assert_eq!(store.job(13).await.unwrap().status, JobStatus::Expired);
}

#[tokio::test]
async fn test_second_instance_skips_within_interval() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let now = Utc::now();
    let first = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "broker-a");
    let second = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "broker-b");

    assert!(matches!(first.run_cycle_at(now).await.unwrap(), SweepReport::Completed { .. }));
    assert_eq!(
        second.run_cycle_at(now + Duration::seconds(60)).await.unwrap(),
        SweepReport::Skipped
    );
    assert!(matches!(
        second.run_cycle_at(now + Duration::seconds(301)).await.unwrap(),
        SweepReport::Completed { .. }
    ));
}

#[tokio::test]
async fn test_heartbeat_keeps_job_alive() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let (qid, resub) = assigned_job(&store, 14).await;
    store
        .update_job_status(&agent(qid, resub, JobStatus::Started))
        .await
        .unwrap();
    store
        .update_job_status(&agent(qid, resub, JobStatus::Running))
        .await
        .unwrap();
    store
        .set_heartbeat(qid, Utc::now() - Duration::minutes(59))
        .await
        .unwrap();

    // Repeating the current status is a heartbeat.
    let update = store
        .update_job_status(&agent(qid, resub, JobStatus::Running))
        .await
        .unwrap();
    assert_eq!(
        update,
        StatusUpdate::Applied {
            previous: JobStatus::Running
        }
    );

    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "test");
    let report = monitor.sweep(Utc::now() + Duration::minutes(30)).await.unwrap();
    assert_eq!(report.moved(), 0);
    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_reported_done_races_with_sweep() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let (qid, resub) = assigned_job(&store, 15).await;
    store
        .update_job_status(&agent(qid, resub, JobStatus::Started))
        .await
        .unwrap();
    store
        .update_job_status(&agent(qid, resub, JobStatus::Running))
        .await
        .unwrap();
    store
        .set_heartbeat(qid, Utc::now() - Duration::hours(2))
        .await
        .unwrap();

    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "test");
    monitor.sweep(Utc::now()).await.unwrap();
    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Zombie);

    // The agent was alive after all. It cannot jump straight to DONE, but a
    // RUNNING report brings the job back and DONE follows from there.
    let update = store
        .update_job_status(&agent(qid, resub, JobStatus::Done))
        .await
        .unwrap();
    assert_eq!(
        update,
        StatusUpdate::Rejected {
            current: JobStatus::Zombie
        }
    );

    let update = store
        .update_job_status(&agent(qid, resub, JobStatus::Running))
        .await
        .unwrap();
    assert_eq!(
        update,
        StatusUpdate::Applied {
            previous: JobStatus::Zombie
        }
    );
    let update = store
        .update_job_status(&agent(qid, resub, JobStatus::Done))
        .await
        .unwrap();
    assert!(update.is_applied());
    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Done);
}

#[tokio::test]
async fn test_heartbeat_revives_zombie() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let (qid, resub) = assigned_job(&store, 16).await;
    store
        .update_job_status(&agent(qid, resub, JobStatus::Started))
        .await
        .unwrap();
    store
        .update_job_status(&agent(qid, resub, JobStatus::Running))
        .await
        .unwrap();
    store
        .set_heartbeat(qid, Utc::now() - Duration::minutes(90))
        .await
        .unwrap();

    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "test");
    monitor.sweep(Utc::now()).await.unwrap();
    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Zombie);

    assert!(!store.touch_heartbeat(qid, resub - 1).await.unwrap());
    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Zombie);

    let before = Utc::now();
    assert!(store.touch_heartbeat(qid, resub).await.unwrap());
    let job = store.job(qid).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert!(job.last_heartbeat.unwrap() >= before);

    // The old heartbeat is gone; the revived job is an hour from ZOMBIE again.
    let report = monitor.sweep(Utc::now() + Duration::minutes(45)).await.unwrap();
    assert_eq!(report.moved(), 0);
    assert_eq!(store.job(qid).await.unwrap().status, JobStatus::Running);
}

#[tokio::test]
async fn test_claim_seeds_heartbeat() {
    let store = Arc::new(MemoryTaskQueueStore::new());
    let before = Utc::now();
    let (qid, _) = assigned_job(&store, 17).await;

    let job = store.job(qid).await.unwrap();
    assert_eq!(job.status, JobStatus::Assigned);
    assert!(job.last_heartbeat.unwrap() >= before);

    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "test");
    assert_eq!(monitor.sweep(Utc::now() + Duration::minutes(59)).await.unwrap().moved(), 0);
    assert_eq!(monitor.sweep(Utc::now() + Duration::minutes(61)).await.unwrap().moved(), 1);
}

#[tokio::test]
async fn test_same_instance_runs_every_tick() {
    // Ticks of one loop land a few milliseconds apart from the interval.
    let store = Arc::new(MemoryTaskQueueStore::new());
    let t0 = Utc::now();
    let monitor = LivenessMonitor::new(store.clone(), LivenessSettings::default(), "broker-a");

    assert!(matches!(
        monitor.run_cycle_at(t0 + Duration::milliseconds(5)).await.unwrap(),
        SweepReport::Completed { .. }
    ));
    assert!(matches!(
        monitor
            .run_cycle_at(t0 + Duration::seconds(300) + Duration::milliseconds(1))
            .await
            .unwrap(),
        SweepReport::Completed { .. }
    ));
}
