//! Integration tests for the Redis heartbeat store.
//!
//! These tests run the store's Lua scripts against a real Redis server and
//! mirror the in-memory store's behaviour.
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test --test redis_integration -- --ignored

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use jobrelay::bus::InMemoryBus;
use jobrelay::heartbeat::redis_store::ACTIVE_JOBS_KEY;
use jobrelay::heartbeat::{HeartbeatStore, RedisHeartbeatStore};
use jobrelay::models::JobStatus;
use jobrelay::services::{StaleJobReaper, StaleJobReaperConfig};

fn get_test_redis_url() -> String {
    std::env::var("REDIS_URL")
        .expect("REDIS_URL environment variable must be set for integration tests")
}

async fn connect() -> (RedisHeartbeatStore, ConnectionManager) {
    let client = redis::Client::open(get_test_redis_url()).expect("Invalid REDIS_URL");
    let conn = ConnectionManager::new(client)
        .await
        .expect("Should connect to Redis");
    (RedisHeartbeatStore::from_connection(conn.clone()), conn)
}

/// Job id that no other test run will touch
fn job_id() -> String {
    format!("it-{}", Uuid::new_v4())
}

async fn cleanup(conn: &mut ConnectionManager, job_ids: &[&str]) {
    for job_id in job_ids {
        let _: redis::RedisResult<()> = conn.del(format!("job:{}", job_id)).await;
        let _: redis::RedisResult<()> = conn.srem(ACTIVE_JOBS_KEY, *job_id).await;
    }
}

#[tokio::test]
#[ignore] // Run with: cargo test --test redis_integration -- --ignored
async fn test_heartbeat_is_monotonic() {
    let (store, mut conn) = connect().await;
    let job = job_id();
    let now = Utc::now();

    assert!(store.record_heartbeat(&job, now).await.unwrap());
    assert!(store
        .record_heartbeat(&job, now - chrono::Duration::seconds(30))
        .await
        .unwrap());

    let record = store.get_record(&job).await.unwrap().expect("Should have record");
    assert_eq!(record.last_seen.timestamp_millis(), now.timestamp_millis());
    assert_eq!(record.status, JobStatus::Active);
    assert!(store.active_job_ids().await.unwrap().contains(&job));

    cleanup(&mut conn, &[&job]).await;
}

#[tokio::test]
#[ignore]
async fn test_mark_stale_only_transitions_active_jobs() {
    let (store, mut conn) = connect().await;
    let job = job_id();
    let missing = job_id();
    let now = Utc::now();
    store.record_heartbeat(&job, now).await.unwrap();
    let cutoff = now + chrono::Duration::seconds(1);

    assert!(store.mark_stale(&job, cutoff).await.unwrap());
    assert!(!store.mark_stale(&job, cutoff).await.unwrap());
    assert!(!store.mark_stale(&missing, cutoff).await.unwrap());

    assert!(!store.active_job_ids().await.unwrap().contains(&job));
    // Heartbeats no longer revive a stale job
    assert!(!store.record_heartbeat(&job, Utc::now()).await.unwrap());
    assert_eq!(
        store.get_record(&job).await.unwrap().unwrap().status,
        JobStatus::Stale
    );

    let stale_at: Option<i64> = conn.hget(format!("job:{}", job), "stale_at_ms").await.unwrap();
    assert!(stale_at.is_some(), "Stale jobs should carry stale_at_ms");

    cleanup(&mut conn, &[&job, &missing]).await;
}

#[tokio::test]
#[ignore]
async fn test_mark_stale_respects_fresh_heartbeat() {
    let (store, mut conn) = connect().await;
    let job = job_id();
    let now = Utc::now();
    store
        .record_heartbeat(&job, now - chrono::Duration::seconds(601))
        .await
        .unwrap();

    // Worker checks in after the caller read the old record
    store.record_heartbeat(&job, now).await.unwrap();

    assert!(!store
        .mark_stale(&job, now - chrono::Duration::seconds(600))
        .await
        .unwrap());
    assert!(!store.mark_stale(&job, now).await.unwrap());
    assert_eq!(
        store.get_record(&job).await.unwrap().unwrap().status,
        JobStatus::Active
    );
    assert!(store.active_job_ids().await.unwrap().contains(&job));

    cleanup(&mut conn, &[&job]).await;
}

#[tokio::test]
#[ignore]
async fn test_mark_stale_reads_legacy_seconds() {
    let (store, mut conn) = connect().await;
    let old = job_id();
    let fresh = job_id();
    let now = Utc::now();

    for (job, age) in [(&old, 700.0), (&fresh, 10.0)] {
        let seconds = now.timestamp_millis() as f64 / 1000.0 - age;
        let _: () = conn
            .hset_multiple(
                format!("job:{}", job),
                &[("status", "active".to_string()), ("last_heartbeat", seconds.to_string())],
            )
            .await
            .unwrap();
        let _: () = conn.sadd(ACTIVE_JOBS_KEY, job.as_str()).await.unwrap();
    }

    let cutoff = now - chrono::Duration::seconds(600);
    assert!(store.mark_stale(&old, cutoff).await.unwrap());
    assert!(!store.mark_stale(&fresh, cutoff).await.unwrap());

    cleanup(&mut conn, &[&old, &fresh]).await;
}

#[tokio::test]
#[ignore]
async fn test_finished_jobs_leave_active_set() {
    let (store, mut conn) = connect().await;
    let done = job_id();
    let running = job_id();
    let never_started = job_id();
    store.record_heartbeat(&done, Utc::now()).await.unwrap();
    store.record_heartbeat(&running, Utc::now()).await.unwrap();

    store.mark_finished(&done, JobStatus::Completed).await.unwrap();
    store
        .mark_finished(&never_started, JobStatus::Failed)
        .await
        .unwrap();

    let active = store.active_job_ids().await.unwrap();
    assert!(!active.contains(&done));
    assert!(active.contains(&running));
    assert!(!store
        .mark_stale(&done, Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap());

    let record = store
        .get_record(&never_started)
        .await
        .unwrap()
        .expect("Finished job should have a readable record");
    assert_eq!(record.status, JobStatus::Failed);

    assert!(store
        .mark_finished(&running, JobStatus::Stale)
        .await
        .is_err());

    cleanup(&mut conn, &[&done, &running, &never_started]).await;
}

#[tokio::test]
#[ignore]
async fn test_reaper_sweeps_redis_store() {
    let (store, mut conn) = connect().await;
    let old = job_id();
    let fresh = job_id();
    let now = Utc::now();
    store
        .record_heartbeat(&old, now - chrono::Duration::seconds(601))
        .await
        .unwrap();
    store
        .record_heartbeat(&fresh, now - chrono::Duration::seconds(10))
        .await
        .unwrap();

    let reaper = StaleJobReaper::new(
        Arc::new(store.clone()),
        Arc::new(InMemoryBus::new()),
        StaleJobReaperConfig {
            sweep_interval: Duration::from_secs(300),
            max_heartbeat_age: Duration::from_secs(600),
            channel: "job_updates".to_string(),
        },
    );
    let report = reaper.sweep_at(now).await.unwrap();

    // Other jobs may share the server; only ours are checked here
    assert!(report.marked_stale.contains(&old));
    assert!(!report.marked_stale.contains(&fresh));
    assert_eq!(
        store.get_record(&fresh).await.unwrap().unwrap().status,
        JobStatus::Active
    );

    cleanup(&mut conn, &[&old, &fresh]).await;
}
