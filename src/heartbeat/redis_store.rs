//! Redis-backed heartbeat store
//!
//! # Key layout
//!
//! - `jobs:active`: set of ACTIVE job ids
//! - `job:{id}`: hash with `status`, `last_heartbeat_ms` and, once reaped,
//!   `stale_at_ms`
//!
//! Conditional transitions run as Lua scripts so a check and its update can
//! never interleave with a concurrent writer.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use super::HeartbeatStore;
use crate::error::{BrokerError, Result};
use crate::models::{HeartbeatRecord, JobStatus};

/// Set holding the ids of every ACTIVE job
pub const ACTIVE_JOBS_KEY: &str = "jobs:active";

const FIELD_STATUS: &str = "status";
const FIELD_LAST_HEARTBEAT_MS: &str = "last_heartbeat_ms";
/// Float seconds, written by older workers
const FIELD_LAST_HEARTBEAT_LEGACY: &str = "last_heartbeat";

// KEYS[1] = job hash, KEYS[2] = active set, ARGV[1] = heartbeat ms, ARGV[2] = job id
const RECORD_HEARTBEAT_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if status and status ~= 'active' then
  return 0
end
local current = tonumber(redis.call('HGET', KEYS[1], 'last_heartbeat_ms') or '0')
if tonumber(ARGV[1]) > current then
  redis.call('HSET', KEYS[1], 'last_heartbeat_ms', ARGV[1])
end
redis.call('HSET', KEYS[1], 'status', 'active')
redis.call('SADD', KEYS[2], ARGV[2])
return 1
";

// KEYS[1] = job hash, KEYS[2] = active set,
// ARGV[1] = job id, ARGV[2] = now ms, ARGV[3] = cutoff ms
const MARK_STALE_SCRIPT: &str = r"
local status = redis.call('HGET', KEYS[1], 'status')
if redis.call('EXISTS', KEYS[1]) == 0 or (status and status ~= 'active') then
  redis.call('SREM', KEYS[2], ARGV[1])
  return 0
end
local last = tonumber(redis.call('HGET', KEYS[1], 'last_heartbeat_ms') or '')
if not last then
  local legacy = tonumber(redis.call('HGET', KEYS[1], 'last_heartbeat') or '')
  if legacy then
    last = legacy * 1000
  end
end
if last and last >= tonumber(ARGV[3]) then
  return 0
end
redis.call('HSET', KEYS[1], 'status', 'stale', 'stale_at_ms', ARGV[2])
redis.call('SREM', KEYS[2], ARGV[1])
return 1
";

// KEYS[1] = job hash, KEYS[2] = active set,
// ARGV[1] = terminal status, ARGV[2] = job id, ARGV[3] = now ms
// A job finished before its first heartbeat is stamped with ARGV[3]
const MARK_FINISHED_SCRIPT: &str = r"
if redis.call('HEXISTS', KEYS[1], 'last_heartbeat_ms') == 0
  and redis.call('HEXISTS', KEYS[1], 'last_heartbeat') == 0 then
  redis.call('HSET', KEYS[1], 'last_heartbeat_ms', ARGV[3])
end
redis.call('HSET', KEYS[1], 'status', ARGV[1])
redis.call('SREM', KEYS[2], ARGV[2])
return 1
";

/// Heartbeat store shared with workers through Redis
#[derive(Clone)]
pub struct RedisHeartbeatStore {
    redis: ConnectionManager,
}

impl RedisHeartbeatStore {
    /// Connect to Redis and create a store
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        info!("Connected heartbeat store to Redis");
        Ok(Self { redis })
    }

    /// Create a store from an existing ConnectionManager
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }

    fn job_key(job_id: &str) -> String {
        format!("job:{}", job_id)
    }
}

fn store_unavailable(err: redis::RedisError) -> BrokerError {
    BrokerError::StoreUnavailable(err.to_string())
}

fn malformed(job_id: &str, reason: &str) -> BrokerError {
    BrokerError::StoreUnavailable(format!(
        "malformed heartbeat record for job {}: {}",
        job_id, reason
    ))
}

/// Build a record from the fields of a `job:{id}` hash
fn parse_record(job_id: &str, fields: &HashMap<String, String>) -> Result<HeartbeatRecord> {
    let status = match fields.get(FIELD_STATUS) {
        Some(raw) => JobStatus::from_str(raw)
            .ok_or_else(|| malformed(job_id, &format!("unknown status {:?}", raw)))?,
        None => JobStatus::Active,
    };

    let last_seen = if let Some(raw) = fields.get(FIELD_LAST_HEARTBEAT_MS) {
        let ms: i64 = raw
            .parse()
            .map_err(|_| malformed(job_id, "last_heartbeat_ms is not an integer"))?;
        DateTime::<Utc>::from_timestamp_millis(ms)
    } else if let Some(raw) = fields.get(FIELD_LAST_HEARTBEAT_LEGACY) {
        let secs: f64 = raw
            .parse()
            .map_err(|_| malformed(job_id, "last_heartbeat is not a number"))?;
        DateTime::<Utc>::from_timestamp_millis((secs * 1000.0) as i64)
    } else {
        return Err(malformed(job_id, "no heartbeat timestamp"));
    }
    .ok_or_else(|| malformed(job_id, "heartbeat timestamp out of range"))?;

    Ok(HeartbeatRecord {
        job_id: job_id.to_string(),
        last_seen,
        status,
    })
}

#[async_trait]
impl HeartbeatStore for RedisHeartbeatStore {
    async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(store_unavailable)?;
        Ok(())
    }

    async fn active_job_ids(&self) -> Result<HashSet<String>> {
        let mut conn = self.redis.clone();
        conn.smembers(ACTIVE_JOBS_KEY)
            .await
            .map_err(store_unavailable)
    }

    async fn get_record(&self, job_id: &str) -> Result<Option<HeartbeatRecord>> {
        let mut conn = self.redis.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(Self::job_key(job_id))
            .await
            .map_err(store_unavailable)?;

        if fields.is_empty() {
            return Ok(None);
        }
        parse_record(job_id, &fields).map(Some)
    }

    async fn mark_stale(&self, job_id: &str, cutoff: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.redis.clone();
        let changed: i64 = redis::Script::new(MARK_STALE_SCRIPT)
            .key(Self::job_key(job_id))
            .key(ACTIVE_JOBS_KEY)
            .arg(job_id)
            .arg(Utc::now().timestamp_millis())
            .arg(cutoff.timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(store_unavailable)?;
        debug!(job_id, changed, "Mark stale");
        Ok(changed == 1)
    }

    async fn record_heartbeat(&self, job_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut conn = self.redis.clone();
        let applied: i64 = redis::Script::new(RECORD_HEARTBEAT_SCRIPT)
            .key(Self::job_key(job_id))
            .key(ACTIVE_JOBS_KEY)
            .arg(at.timestamp_millis())
            .arg(job_id)
            .invoke_async(&mut conn)
            .await
            .map_err(store_unavailable)?;
        Ok(applied == 1)
    }

    async fn mark_finished(&self, job_id: &str, status: JobStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(BrokerError::InvalidMessage(format!(
                "{} is not a terminal job status",
                status
            )));
        }

        let mut conn = self.redis.clone();
        let _: i64 = redis::Script::new(MARK_FINISHED_SCRIPT)
            .key(Self::job_key(job_id))
            .key(ACTIVE_JOBS_KEY)
            .arg(status.as_str())
            .arg(job_id)
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(store_unavailable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_record_millis() {
        let record = parse_record(
            "job-1",
            &fields(&[("status", "active"), ("last_heartbeat_ms", "1700000000000")]),
        )
        .unwrap();
        assert_eq!(record.status, JobStatus::Active);
        assert_eq!(record.last_seen.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_record_legacy_seconds() {
        let record = parse_record(
            "job-1",
            &fields(&[("status", "stale"), ("last_heartbeat", "1700000000.5")]),
        )
        .unwrap();
        assert_eq!(record.status, JobStatus::Stale);
        assert_eq!(record.last_seen.timestamp_millis(), 1_700_000_000_500);
    }

    #[test]
    fn test_parse_record_defaults_to_active() {
        let record =
            parse_record("job-1", &fields(&[("last_heartbeat_ms", "1000")])).unwrap();
        assert_eq!(record.status, JobStatus::Active);
    }

    #[test]
    fn test_parse_record_rejects_malformed() {
        assert!(parse_record("job-1", &fields(&[("status", "active")])).is_err());
        assert!(parse_record(
            "job-1",
            &fields(&[("status", "weird"), ("last_heartbeat_ms", "1")])
        )
        .is_err());
        assert!(parse_record("job-1", &fields(&[("last_heartbeat_ms", "soon")])).is_err());
    }

    #[test]
    fn test_job_key() {
        assert_eq!(RedisHeartbeatStore::job_key("abc"), "job:abc");
    }
}
