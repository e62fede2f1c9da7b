//! Broker facade
//!
//! Owns the session registry, the event bus bridge and the stale job reaper,
//! and drives them through one start/stop lifecycle:
//!
//! ```text
//! UNINITIALIZED --start--> RUNNING --stop--> STOPPING --> STOPPED
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::{Backoff, EventBusBridge, MessageBus};
use crate::error::{BrokerError, Result};
use crate::heartbeat::HeartbeatStore;
use crate::models::{ClientMessage, ServerMessage};
use crate::registry::{Session, SessionHandle, SessionId, SessionRegistry, SessionTransport};
use crate::services::{StaleJobReaper, StaleJobReaperConfig};

/// Explicit settings for the broker core
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Bus channel carrying job events
    pub channel: String,
    /// Time between stale job sweeps
    pub sweep_interval: Duration,
    /// Heartbeat age beyond which a job is stale
    pub max_heartbeat_age: Duration,
    /// Upper bound on a single session send
    pub send_timeout: Duration,
    /// Bus resubscribe policy
    pub backoff: Backoff,
    /// How long `stop` waits for each background task before aborting it
    pub shutdown_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel: "job_updates".to_string(),
            sweep_interval: Duration::from_secs(300),
            max_heartbeat_age: Duration::from_secs(600),
            send_timeout: Duration::from_secs(5),
            backoff: Backoff::default(),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

/// Broker lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Uninitialized,
    Running,
    Stopping,
    Stopped,
}

struct BackgroundTasks {
    shutdown_tx: watch::Sender<bool>,
    bridge: JoinHandle<Result<()>>,
    reaper: JoinHandle<Result<()>>,
}

/// Real-time job update broker
pub struct Broker {
    config: BrokerConfig,
    registry: Arc<SessionRegistry>,
    bus: Arc<dyn MessageBus>,
    store: Arc<dyn HeartbeatStore>,
    state: RwLock<LifecycleState>,
    /// Also serializes start and stop
    tasks: Mutex<Option<BackgroundTasks>>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        bus: Arc<dyn MessageBus>,
        store: Arc<dyn HeartbeatStore>,
    ) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.send_timeout));
        Self {
            config,
            registry,
            bus,
            store,
            state: RwLock::new(LifecycleState::Uninitialized),
            tasks: Mutex::new(None),
        }
    }

    /// Connect the backends and spawn the background tasks
    ///
    /// Fails with `AlreadyRunning` unless the broker was never started. A
    /// failure to reach the heartbeat store or open the bus subscription is
    /// returned as is and leaves the broker UNINITIALIZED.
    #[instrument(skip(self), fields(channel = %self.config.channel))]
    pub async fn start(&self) -> Result<()> {
        let mut tasks = self.tasks.lock().await;
        if self.state() != LifecycleState::Uninitialized {
            return Err(BrokerError::AlreadyRunning);
        }

        self.store.ping().await?;
        let initial = self.bus.subscribe(&self.config.channel).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let bridge = EventBusBridge::new(
            self.bus.clone(),
            self.registry.clone(),
            self.config.channel.clone(),
            self.config.backoff.clone(),
        );
        let bridge = tokio::spawn(supervise(
            "event_bus_bridge",
            bridge.run(Some(initial), shutdown_rx.clone()),
        ));

        let reaper = StaleJobReaper::new(
            self.store.clone(),
            self.bus.clone(),
            StaleJobReaperConfig {
                sweep_interval: self.config.sweep_interval,
                max_heartbeat_age: self.config.max_heartbeat_age,
                channel: self.config.channel.clone(),
            },
        );
        let reaper = tokio::spawn(supervise("stale_job_reaper", async move {
            reaper.run(shutdown_rx).await
        }));

        *tasks = Some(BackgroundTasks {
            shutdown_tx,
            bridge,
            reaper,
        });
        *self.state.write() = LifecycleState::Running;

        info!("Broker started");
        Ok(())
    }

    /// Stop the background tasks and close every session
    ///
    /// Does nothing if the broker never started or already stopped. Never
    /// fails: task and bus errors during shutdown are logged.
    #[instrument(skip(self))]
    pub async fn stop(&self) {
        let mut tasks = self.tasks.lock().await;
        match self.state() {
            LifecycleState::Uninitialized | LifecycleState::Stopped => {
                debug!("Broker not running, nothing to stop");
                return;
            }
            LifecycleState::Running | LifecycleState::Stopping => {}
        }

        *self.state.write() = LifecycleState::Stopping;
        info!("Stopping broker");

        if let Some(tasks) = tasks.take() {
            let _ = tasks.shutdown_tx.send(true);
            let grace = self.config.shutdown_grace;
            await_task("event_bus_bridge", tasks.bridge, grace).await;
            await_task("stale_job_reaper", tasks.reaper, grace).await;
        }

        let closed = self.registry.close_all().await;

        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "Failed to close event bus connection");
        }

        *self.state.write() = LifecycleState::Stopped;
        info!(closed_sessions = closed, "Broker stopped");
    }

    /// Accept a new client connection
    ///
    /// Wraps the transport in a session with a fresh id and registers it.
    /// Refused once the broker is shutting down.
    pub fn connect(&self, transport: Box<dyn SessionTransport>) -> Result<SessionHandle> {
        self.ensure_accepting()?;

        let handle = self
            .registry
            .register(Session::new(SessionId::generate(), transport))?;

        // stop() may have drained the registry between the check and the insert
        if let Err(e) = self.ensure_accepting() {
            let registry = self.registry.clone();
            let id = handle.id().clone();
            tokio::spawn(async move {
                registry.remove(&id).await;
            });
            return Err(e);
        }

        debug!(session_id = %handle.id(), "Client connected");
        Ok(handle)
    }

    /// Remove a session and close its transport
    pub async fn disconnect(&self, id: &SessionId) -> bool {
        let removed = self.registry.remove(id).await;
        if removed {
            debug!(session_id = %id, "Client disconnected");
        }
        removed
    }

    /// Route one message received from a client
    ///
    /// Malformed messages fail with `InvalidMessage` and leave the session
    /// connected.
    pub fn handle_inbound(&self, id: &SessionId, raw: &str) -> Result<ServerMessage> {
        match ClientMessage::parse(raw)? {
            ClientMessage::Subscribe { topic } => {
                self.registry.subscribe(id, &topic)?;
                Ok(ServerMessage::Subscribed { topic })
            }
            ClientMessage::Unsubscribe { topic } => {
                self.registry.unsubscribe(id, &topic)?;
                Ok(ServerMessage::Unsubscribed { topic })
            }
            ClientMessage::Ping => {
                if !self.registry.contains(id) {
                    return Err(BrokerError::SessionNotFound { id: id.to_string() });
                }
                Ok(ServerMessage::Pong)
            }
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.read()
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// True while both background tasks are running
    ///
    /// Reports false while a start or stop is in progress.
    pub fn background_tasks_alive(&self) -> bool {
        match self.tasks.try_lock() {
            Ok(tasks) => tasks
                .as_ref()
                .map(|t| !t.bridge.is_finished() && !t.reaper.is_finished())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        match self.state() {
            LifecycleState::Stopping | LifecycleState::Stopped => Err(BrokerError::ShuttingDown),
            LifecycleState::Uninitialized | LifecycleState::Running => Ok(()),
        }
    }
}

/// Log a background task's terminal error before handing it to the joiner
async fn supervise<F>(name: &'static str, task: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = task.await;
    if let Err(e) = &result {
        error!(task = name, error = %e, "Background task terminated");
    }
    result
}

async fn await_task(name: &'static str, mut handle: JoinHandle<Result<()>>, grace: Duration) {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(Ok(()))) => debug!(task = name, "Background task stopped"),
        Ok(Ok(Err(e))) => warn!(task = name, error = %e, "Background task had failed"),
        Ok(Err(e)) if e.is_panic() => error!(task = name, "Background task panicked"),
        Ok(Err(e)) => warn!(task = name, error = %e, "Background task was cancelled"),
        Err(_) => {
            warn!(
                task = name,
                grace_ms = grace.as_millis() as u64,
                "Background task ignored shutdown, aborting"
            );
            handle.abort();
            let _ = handle.await;
        }
    }
}
