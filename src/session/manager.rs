//! Discovery loop and session registry
//!
//! Each scan lists resources, applies the filter, opens sessions for new
//! resources and tears down sessions whose resource disappeared (disconnected,
//! closed, then `SessionRemoved`). With `auto_reconnect` the scan also retries
//! sessions left in `Error` or `Disconnected`. Sessions added by hand through
//! [`SessionManager::add_session`] are never removed by a scan, since TCP/IP
//! instruments cannot be discovered.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::device::{DeviceSession, SessionState};
use super::events::{EventHandler, EventRegistry, SessionEvent, SessionEventKind, SubscriptionId};
use super::filter::ResourceFilter;
use crate::config::SessionSettings;
use crate::error::{ConnectErrorKind, VisaError, VisaResult};
use crate::manager::ResourceManager;
use crate::resource::ResourceAddress;

/// What one discovery scan changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Sessions created for newly discovered resources
    pub added: Vec<String>,
    /// Sessions dropped because their resource vanished
    pub removed: Vec<String>,
    /// Sessions reopened after an error or disconnect
    pub reconnected: Vec<String>,
}

impl ScanReport {
    /// True when the scan changed nothing.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reconnected.is_empty()
    }
}

struct ManagerShared {
    resources: Arc<ResourceManager>,
    settings: SessionSettings,
    filter: RwLock<ResourceFilter>,
    sessions: Mutex<HashMap<String, Arc<DeviceSession>>>,
    events: Arc<EventRegistry>,
}

impl ManagerShared {
    fn new_session(&self, resource: String, discovered: bool) -> Arc<DeviceSession> {
        Arc::new(DeviceSession::new(
            resource,
            discovered,
            self.resources.clone(),
            self.events.clone(),
            &self.settings,
        ))
    }

    async fn retire(&self, session: &DeviceSession) {
        session.mark_disconnected();
        session.close().await;
        self.events.emit(&SessionEvent::SessionRemoved {
            resource: session.resource().to_string(),
        });
        info!(resource = %session.resource(), "Session removed");
    }

    async fn scan(&self) -> VisaResult<ScanReport> {
        let listed = self.resources.list_resources(None).await?;
        let present: BTreeSet<String> = {
            let filter = self.filter.read().unwrap_or_else(PoisonError::into_inner);
            listed.into_iter().filter(|r| filter.matches(r)).collect()
        };

        let (vanished, added) = {
            let mut sessions = self.sessions.lock().await;
            let vanished: Vec<Arc<DeviceSession>> = sessions
                .values()
                .filter(|s| s.is_discovered() && !present.contains(s.resource()))
                .cloned()
                .collect();
            for session in &vanished {
                sessions.remove(session.resource());
            }

            let mut added = Vec::new();
            for resource in &present {
                if !sessions.contains_key(resource) {
                    let session = self.new_session(resource.clone(), true);
                    sessions.insert(resource.clone(), session.clone());
                    added.push(session);
                }
            }
            (vanished, added)
        };

        let mut report = ScanReport::default();

        for session in vanished {
            self.retire(&session).await;
            report.removed.push(session.resource().to_string());
        }

        for session in &added {
            self.events.emit(&SessionEvent::SessionAdded {
                resource: session.resource().to_string(),
            });
            if let Err(e) = session.reconnect().await {
                debug!(resource = %session.resource(), error = %e, "New session not connected yet");
            }
            report.added.push(session.resource().to_string());
        }

        if self.settings.auto_reconnect {
            let fresh: HashSet<&str> = added.iter().map(|s| s.resource()).collect();
            let candidates: Vec<Arc<DeviceSession>> = self
                .sessions
                .lock()
                .await
                .values()
                .filter(|s| !fresh.contains(s.resource()))
                .filter(|s| matches!(s.state(), SessionState::Error | SessionState::Disconnected))
                .cloned()
                .collect();
            for session in candidates {
                match session.reconnect().await {
                    Ok(()) => report.reconnected.push(session.resource().to_string()),
                    Err(e) => debug!(resource = %session.resource(), error = %e, "Reconnect failed"),
                }
            }
        }

        Ok(report)
    }
}

/// Supervises sessions for discovered and manually added resources.
pub struct SessionManager {
    shared: Arc<ManagerShared>,
    discovery_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// The filter comes from `settings.filter` (a pattern list) when set.
    pub fn new(resources: Arc<ResourceManager>, settings: SessionSettings) -> Self {
        let filter = settings
            .filter
            .clone()
            .map(ResourceFilter::patterns)
            .unwrap_or_default();
        Self {
            shared: Arc::new(ManagerShared {
                resources,
                settings,
                filter: RwLock::new(filter),
                sessions: Mutex::new(HashMap::new()),
                events: Arc::new(EventRegistry::new()),
            }),
            discovery_task: std::sync::Mutex::new(None),
        }
    }

    /// The resource manager sessions open through.
    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.shared.resources
    }

    /// Replace the filter used by subsequent scans.
    pub fn set_filter(&self, filter: ResourceFilter) {
        *self.shared.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
    }

    /// Start scanning every `discovery_interval`; the first scan runs immediately.
    pub fn start(&self) {
        let mut task = self.discovery_task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let shared = self.shared.clone();
        let interval = shared.settings.discovery_interval;
        info!(interval = ?interval, "Starting session discovery");
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match shared.scan().await {
                    Ok(report) if !report.is_empty() => info!(
                        added = report.added.len(),
                        removed = report.removed.len(),
                        reconnected = report.reconnected.len(),
                        "Discovery scan changed sessions"
                    ),
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Discovery scan failed"),
                }
            }
        }));
    }

    /// Stop the discovery loop. Sessions stay open.
    pub fn stop(&self) {
        if let Some(task) = self
            .discovery_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
            info!("Stopped session discovery");
        }
    }

    /// Whether the discovery loop is running.
    pub fn is_running(&self) -> bool {
        self.discovery_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Run one discovery scan now.
    pub async fn scan_now(&self) -> VisaResult<ScanReport> {
        self.shared.scan().await
    }

    /// Supervise `resource` regardless of the filter.
    ///
    /// Returns the existing session if there is one. A failed first connect
    /// leaves the session registered in `Error` for later reconnects.
    pub async fn add_session(&self, resource: &str) -> VisaResult<Arc<DeviceSession>> {
        let key = ResourceAddress::normalize(resource)?;
        let session = {
            let mut sessions = self.shared.sessions.lock().await;
            if let Some(existing) = sessions.get(&key) {
                return Ok(existing.clone());
            }
            let session = self.shared.new_session(key.clone(), false);
            sessions.insert(key, session.clone());
            session
        };

        self.shared.events.emit(&SessionEvent::SessionAdded {
            resource: session.resource().to_string(),
        });
        if let Err(e) = session.reconnect().await {
            warn!(resource = %session.resource(), error = %e, "Added session could not connect");
        }
        Ok(session)
    }

    /// Close and drop the session for `resource`. Returns false if there was none.
    pub async fn remove_session(&self, resource: &str) -> VisaResult<bool> {
        let key = ResourceAddress::normalize(resource)?;
        let removed = self.shared.sessions.lock().await.remove(&key);
        match removed {
            Some(session) => {
                self.shared.retire(&session).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Reopen the transport of the session for `resource`.
    pub async fn reconnect(&self, resource: &str) -> VisaResult<()> {
        let session = self
            .session(resource)
            .await
            .ok_or_else(|| VisaError::connect(resource, ConnectErrorKind::NotFound))?;
        session.reconnect().await
    }

    /// Session for `resource`, if one exists.
    pub async fn session(&self, resource: &str) -> Option<Arc<DeviceSession>> {
        let key = ResourceAddress::normalize(resource).ok()?;
        self.shared.sessions.lock().await.get(&key).cloned()
    }

    /// Every supervised session, ordered by resource string.
    pub async fn sessions(&self) -> Vec<Arc<DeviceSession>> {
        let mut sessions: Vec<Arc<DeviceSession>> =
            self.shared.sessions.lock().await.values().cloned().collect();
        sessions.sort_by(|a, b| a.resource().cmp(b.resource()));
        sessions
    }

    /// Register `handler` for events of `kind`.
    pub fn subscribe(&self, kind: SessionEventKind, handler: EventHandler) -> SubscriptionId {
        self.shared.events.subscribe(kind, handler)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Stop discovery and remove every session.
    pub async fn shutdown(&self) {
        self.stop();
        let drained: Vec<Arc<DeviceSession>> = self
            .shared
            .sessions
            .lock()
            .await
            .drain()
            .map(|(_, s)| s)
            .collect();
        for session in drained {
            self.shared.retire(&session).await;
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.stop();
    }
}
