//! Session registry
//!
//! Tracks open client sessions and which topics each one follows. A single
//! short-held lock guards both the session table and the topic index so a
//! session can never be half-removed. Delivery snapshots the subscriber list
//! under the lock and performs transport I/O after releasing it.

mod session;
#[cfg(test)]
pub(crate) mod testing;

pub use session::{Session, SessionHandle, SessionId, SessionState, SessionTransport};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{BrokerError, Result, SessionDeliveryError};

/// Default upper bound on a single transport send
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of pushing one payload to a topic's subscribers
#[derive(Debug, Clone, Default)]
pub struct DeliveryReport {
    pub topic: String,
    pub delivered: Vec<SessionId>,
    pub failed: Vec<(SessionId, SessionDeliveryError)>,
    /// Sessions that were already closing when their turn came
    pub skipped: Vec<SessionId>,
}

impl DeliveryReport {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            ..Self::default()
        }
    }

    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn failed_ids(&self) -> Vec<SessionId> {
        self.failed.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct SessionEntry {
    session: Arc<Session>,
    topics: HashSet<String>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<SessionId, SessionEntry>,
    topics: HashMap<String, HashSet<SessionId>>,
}

/// Registry of live client sessions and their topic subscriptions
pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    send_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            send_timeout,
        }
    }

    /// Add a session and mark it open
    pub fn register(&self, session: Session) -> Result<SessionHandle> {
        let mut inner = self.inner.write();

        if inner.sessions.contains_key(session.id()) {
            return Err(BrokerError::DuplicateSession {
                id: session.id().to_string(),
            });
        }

        session.mark_open();
        let id = session.id().clone();
        let session = Arc::new(session);
        inner.sessions.insert(
            id.clone(),
            SessionEntry {
                session: session.clone(),
                topics: HashSet::new(),
            },
        );

        debug!(session_id = %id, "Session registered");
        Ok(SessionHandle::new(session))
    }

    /// Follow a topic. Returns false if the session already followed it.
    pub fn subscribe(&self, id: &SessionId, topic: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let RegistryInner { sessions, topics } = &mut *inner;

        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| BrokerError::SessionNotFound { id: id.to_string() })?;

        if !entry.topics.insert(topic.to_string()) {
            return Ok(false);
        }
        topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone());

        debug!(session_id = %id, topic, "Session subscribed");
        Ok(true)
    }

    /// Stop following a topic. Returns false if the session did not follow it.
    pub fn unsubscribe(&self, id: &SessionId, topic: &str) -> Result<bool> {
        let mut inner = self.inner.write();
        let RegistryInner { sessions, topics } = &mut *inner;

        let entry = sessions
            .get_mut(id)
            .ok_or_else(|| BrokerError::SessionNotFound { id: id.to_string() })?;

        if !entry.topics.remove(topic) {
            return Ok(false);
        }
        detach(topics, topic, id);

        debug!(session_id = %id, topic, "Session unsubscribed");
        Ok(true)
    }

    /// Send a payload to every session subscribed to `topic`
    ///
    /// Sessions whose send fails are removed before this returns.
    pub async fn deliver(&self, topic: &str, payload: &str) -> DeliveryReport {
        let targets: Vec<Arc<Session>> = {
            let inner = self.inner.read();
            match inner.topics.get(topic) {
                Some(ids) => ids
                    .iter()
                    .filter_map(|id| inner.sessions.get(id).map(|e| e.session.clone()))
                    .collect(),
                None => Vec::new(),
            }
        };

        let mut report = DeliveryReport::new(topic);
        if targets.is_empty() {
            return report;
        }

        let send_timeout = self.send_timeout;
        let outcomes = join_all(targets.iter().map(|session| async move {
            if !session.is_open() {
                return (session.id().clone(), None);
            }
            let result = session.send(payload, send_timeout).await;
            (session.id().clone(), Some(result))
        }))
        .await;

        for (id, outcome) in outcomes {
            match outcome {
                None => report.skipped.push(id),
                Some(Ok(())) => report.delivered.push(id),
                Some(Err(e)) => {
                    warn!(session_id = %id, topic, error = %e, "Delivery to session failed");
                    report.failed.push((id, e));
                }
            }
        }

        for id in report.failed_ids() {
            self.remove(&id).await;
        }

        report.delivered.sort();
        report.skipped.sort();
        report.failed.sort_by(|a, b| a.0.cmp(&b.0));
        report
    }

    /// Remove a session from every topic and close its transport
    ///
    /// Returns false if the session was not registered.
    pub async fn remove(&self, id: &SessionId) -> bool {
        let session = {
            let mut inner = self.inner.write();
            let RegistryInner { sessions, topics } = &mut *inner;

            let Some(entry) = sessions.remove(id) else {
                return false;
            };
            for topic in &entry.topics {
                detach(topics, topic, id);
            }
            entry.session.begin_close();
            entry.session
        };

        session.finish_close().await;
        debug!(session_id = %id, "Session removed");
        true
    }

    /// Remove and close every session. Returns how many were closed.
    pub async fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = {
            let mut inner = self.inner.write();
            inner.topics.clear();
            inner
                .sessions
                .drain()
                .map(|(_, entry)| {
                    entry.session.begin_close();
                    entry.session
                })
                .collect()
        };

        let count = sessions.len();
        join_all(sessions.iter().map(|s| s.finish_close())).await;

        if count > 0 {
            info!(count, "Closed all sessions");
        }
        count
    }

    /// Sessions currently subscribed to a topic, sorted
    pub fn subscribers(&self, topic: &str) -> Vec<SessionId> {
        let inner = self.inner.read();
        let mut ids: Vec<SessionId> = inner
            .topics
            .get(topic)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Topics a session follows, sorted
    pub fn topics_for(&self, id: &SessionId) -> Vec<String> {
        let inner = self.inner.read();
        let mut topics: Vec<String> = inner
            .sessions
            .get(id)
            .map(|e| e.topics.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.read().sessions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn topic_count(&self) -> usize {
        self.inner.read().topics.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SEND_TIMEOUT)
    }
}

fn detach(topics: &mut HashMap<String, HashSet<SessionId>>, topic: &str, id: &SessionId) {
    if let Some(ids) = topics.get_mut(topic) {
        ids.remove(id);
        if ids.is_empty() {
            topics.remove(topic);
        }
    }
}
