//! Stale job reaper
//!
//! Periodically scans the heartbeat store for ACTIVE jobs whose worker went
//! quiet, flips them to STALE and announces each one on the event bus.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::bus::MessageBus;
use crate::error::Result;
use crate::heartbeat::HeartbeatStore;
use crate::models::StaleJobEvent;

/// Stale job reaper configuration
#[derive(Debug, Clone)]
pub struct StaleJobReaperConfig {
    /// Time between sweeps
    pub sweep_interval: Duration,
    /// Heartbeat age beyond which an ACTIVE job is stale
    pub max_heartbeat_age: Duration,
    /// Bus channel stale events are published on
    pub channel: String,
}

impl Default for StaleJobReaperConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            max_heartbeat_age: Duration::from_secs(600),
            channel: "job_updates".to_string(),
        }
    }
}

/// Unpublished stale events kept for the next sweep
const MAX_PENDING_EVENTS: usize = 1024;

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// ACTIVE jobs examined
    pub checked: usize,
    /// Jobs this sweep moved to STALE and announced, in id order
    pub marked_stale: Vec<String>,
    /// Jobs expired by an earlier sweep whose event went out on this one
    pub republished: Vec<String>,
    /// Jobs skipped or events left unpublished because the store or bus failed
    pub errors: usize,
}

/// Background task expiring jobs with silent workers
pub struct StaleJobReaper {
    store: Arc<dyn HeartbeatStore>,
    bus: Arc<dyn MessageBus>,
    config: StaleJobReaperConfig,
    /// Jobs already moved to STALE whose event could not be published
    pending: Mutex<VecDeque<StaleJobEvent>>,
}

impl StaleJobReaper {
    pub fn new(
        store: Arc<dyn HeartbeatStore>,
        bus: Arc<dyn MessageBus>,
        config: StaleJobReaperConfig,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &StaleJobReaperConfig {
        &self.config
    }

    /// Number of stale events waiting for the bus
    pub fn pending_events(&self) -> usize {
        self.pending.lock().len()
    }

    /// Run sweeps until the shutdown channel changes
    ///
    /// The first sweep happens one interval after startup. Store and bus
    /// outages are logged and retried on the next tick; any other error ends
    /// the task.
    #[instrument(skip(self, shutdown), fields(channel = %self.config.channel))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            "Starting stale job reaper (interval: {}s, max heartbeat age: {}s)",
            self.config.sweep_interval.as_secs(),
            self.config.max_heartbeat_age.as_secs()
        );

        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip immediate tick

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report)
                            if !report.marked_stale.is_empty()
                                || !report.republished.is_empty()
                                || report.errors > 0 =>
                        {
                            info!(
                                checked = report.checked,
                                stale = report.marked_stale.len(),
                                republished = report.republished.len(),
                                errors = report.errors,
                                "Stale job sweep finished"
                            );
                        }
                        Ok(report) => {
                            debug!(checked = report.checked, "Stale job sweep found nothing");
                        }
                        Err(e) if e.is_infrastructure() => {
                            warn!(error = %e, "Stale job sweep failed, retrying next interval");
                        }
                        Err(e) => {
                            error!(error = %e, "Stale job reaper stopping on unrecoverable error");
                            return Err(e);
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Stale job reaper shutting down");
        Ok(())
    }

    /// Run one sweep against the current time
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one sweep as of `now`
    ///
    /// Events left over from earlier sweeps are published first. Fails only
    /// if the active job set cannot be read. Failures on single jobs are
    /// counted in the report and the sweep moves on.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        self.flush_pending(&mut report).await?;

        let Some(cutoff) = self.cutoff(now) else {
            return Ok(report);
        };

        let mut job_ids: Vec<String> = self.store.active_job_ids().await?.into_iter().collect();
        job_ids.sort();
        report.checked = job_ids.len();

        for job_id in job_ids {
            let event = match self.reap_if_stale(&job_id, now, cutoff).await {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) if e.is_infrastructure() => {
                    warn!(job_id = %job_id, error = %e, "Failed to check job heartbeat");
                    report.errors += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.publish(&event).await {
                Ok(()) => report.marked_stale.push(job_id),
                Err(e) if e.is_infrastructure() => {
                    warn!(job_id = %job_id, error = %e, "Stale job event not published, will retry");
                    report.errors += 1;
                    self.defer(event);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(report)
    }

    /// Oldest heartbeat a job may have and still be considered alive
    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let max_age = chrono::Duration::from_std(self.config.max_heartbeat_age).ok()?;
        now.checked_sub_signed(max_age)
    }

    /// Expire one job if its heartbeat is too old
    ///
    /// Returns the event to announce only when this call moved the job to
    /// STALE. The store rechecks the heartbeat against `cutoff` atomically,
    /// so a heartbeat landing after the read keeps the job ACTIVE.
    async fn reap_if_stale(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<StaleJobEvent>> {
        let record = match self.store.get_record(job_id).await? {
            Some(record) if record.status.is_active() => record,
            _ => return Ok(None),
        };

        if record.last_seen >= cutoff {
            return Ok(None);
        }

        if !self.store.mark_stale(job_id, cutoff).await? {
            debug!(job_id, "Job left ACTIVE or checked in before it could be reaped");
            return Ok(None);
        }

        let age = record.age_at(now);
        info!(job_id, age_secs = age.num_seconds(), "Marked job stale");
        Ok(Some(StaleJobEvent::heartbeat_timeout(job_id, age, now)))
    }

    async fn publish(&self, event: &StaleJobEvent) -> Result<()> {
        let envelope = event.clone().into_envelope()?;
        let raw = serde_json::to_string(&envelope)?;
        self.bus.publish(&self.config.channel, &raw).await
    }

    fn defer(&self, event: StaleJobEvent) {
        let mut pending = self.pending.lock();
        if pending.len() >= MAX_PENDING_EVENTS {
            if let Some(dropped) = pending.pop_front() {
                warn!(job_id = %dropped.job_id, "Dropping oldest unpublished stale job event");
            }
        }
        pending.push_back(event);
    }

    /// Publish events deferred by earlier sweeps, stopping at the first bus failure
    async fn flush_pending(&self, report: &mut SweepReport) -> Result<()> {
        let events: Vec<StaleJobEvent> = self.pending.lock().drain(..).collect();
        let mut events = events.into_iter();

        while let Some(event) = events.next() {
            match self.publish(&event).await {
                Ok(()) => report.republished.push(event.job_id),
                Err(e) => {
                    let mut pending = self.pending.lock();
                    let leftover: Vec<StaleJobEvent> =
                        std::iter::once(event).chain(events).collect();
                    for (i, event) in leftover.into_iter().enumerate() {
                        pending.insert(i, event);
                    }
                    if e.is_infrastructure() {
                        warn!(pending = pending.len(), error = %e, "Bus still unavailable for stale job events");
                        report.errors += 1;
                        return Ok(());
                    }
                    return Err(e);
                }
            }
        }

        Ok(())
    }
}
