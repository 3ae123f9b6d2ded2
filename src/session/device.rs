//! Supervised session for one resource
//!
//! All work for a resource goes through a FIFO job queue drained by a single
//! worker task, so at most one request is in flight on the transport at any
//! time. A reconnect holds the transport slot while it reopens the resource;
//! queued jobs wait for it rather than fail.
//!
//! Every outcome of [`DeviceSession::execute`] feeds the error counter: a
//! success resets it and marks the session connected, and
//! `max_consecutive_errors` failures in a row (timeouts included) move the
//! session to [`SessionState::Error`].

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, trace, warn};

use super::events::{EventRegistry, SessionEvent};
use crate::config::SessionSettings;
use crate::error::{VisaError, VisaResult};
use crate::manager::{ResourceManager, SharedTransport};
use crate::transport::Transport;

const JOB_QUEUE_DEPTH: usize = 100;

/// Health of a [`DeviceSession`] as seen by its callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Opening, or reopening, the transport
    Connecting,
    /// The last operation succeeded
    Connected,
    /// Resource vanished or the session was closed
    Disconnected,
    /// Too many consecutive failures, or a reconnect failed
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Error => "error",
        };
        f.write_str(text)
    }
}

type Job = Box<dyn for<'a> FnOnce(Option<&'a mut dyn Transport>) -> BoxFuture<'a, ()> + Send>;

fn job<F>(f: F) -> Job
where
    F: for<'a> FnOnce(Option<&'a mut dyn Transport>) -> BoxFuture<'a, ()> + Send + 'static,
{
    Box::new(f)
}

struct SessionShared {
    resource: String,
    resources: Arc<ResourceManager>,
    events: Arc<EventRegistry>,
    transport: Mutex<Option<SharedTransport>>,
    state: std::sync::Mutex<SessionState>,
    error_count: AtomicU32,
    max_errors: u32,
    closed: AtomicBool,
    status: std::sync::Mutex<Option<serde_json::Value>>,
}

impl SessionShared {
    fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: SessionState) {
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, next)
        };
        if previous != next {
            debug!(resource = %self.resource, from = %previous, to = %next, "Session state changed");
            self.events.emit(&SessionEvent::SessionStateChanged {
                resource: self.resource.clone(),
                from: previous,
                to: next,
            });
        }
    }

    fn record<T>(&self, outcome: &VisaResult<T>) {
        match outcome {
            Ok(_) => {
                self.error_count.store(0, Ordering::SeqCst);
                self.set_state(SessionState::Connected);
            }
            Err(VisaError::SessionClosed(_)) => {}
            Err(e) => {
                let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(resource = %self.resource, error = %e, count, "Session operation failed");
                if count >= self.max_errors && self.state() != SessionState::Error {
                    warn!(
                        resource = %self.resource,
                        errors = count,
                        "Too many consecutive failures, session entering error state"
                    );
                    self.set_state(SessionState::Error);
                }
            }
        }
    }

    async fn reconnect(&self) -> VisaResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(VisaError::SessionClosed(self.resource.clone()));
        }

        let mut slot = self.transport.lock().await;
        let previous = self.state();
        self.set_state(SessionState::Connecting);

        if slot.take().is_some() {
            if let Err(e) = self.resources.close(&self.resource).await {
                debug!(resource = %self.resource, error = %e, "Closing previous transport failed");
            }
        }

        match self.resources.open(&self.resource).await {
            Ok(transport) => {
                *slot = Some(transport);
                self.error_count.store(0, Ordering::SeqCst);
                self.set_state(SessionState::Connected);
                info!(resource = %self.resource, "Session connected");
                Ok(())
            }
            Err(e) => {
                let next = if previous == SessionState::Disconnected {
                    SessionState::Disconnected
                } else {
                    SessionState::Error
                };
                self.set_state(next);
                warn!(resource = %self.resource, error = %e, "Session connect failed");
                Err(e)
            }
        }
    }
}

/// Drain the job queue, one job at a time, in submission order.
async fn run_job_queue(shared: Arc<SessionShared>, mut jobs: mpsc::Receiver<Job>) {
    debug!(resource = %shared.resource, "Starting session job queue");

    while let Some(job) = jobs.recv().await {
        let slot = shared.transport.lock().await;
        match slot.as_ref() {
            Some(handle) => {
                let mut guard = handle.lock().await;
                let transport: &mut dyn Transport = &mut **guard;
                trace!(resource = %shared.resource, "Running session job");
                job(Some(transport)).await;
            }
            None => job(None).await,
        }
    }

    debug!(resource = %shared.resource, "Session job queue ended");
}

/// One resource behind a FIFO job queue, with error accounting and reconnect.
pub struct DeviceSession {
    shared: Arc<SessionShared>,
    jobs: mpsc::Sender<Job>,
    default_timeout: Duration,
    discovered: bool,
}

impl DeviceSession {
    /// Create an unconnected session and start its worker.
    ///
    /// Must be called from within a Tokio runtime.
    pub(crate) fn new(
        resource: String,
        discovered: bool,
        resources: Arc<ResourceManager>,
        events: Arc<EventRegistry>,
        settings: &SessionSettings,
    ) -> Self {
        let shared = Arc::new(SessionShared {
            resource,
            resources,
            events,
            transport: Mutex::new(None),
            state: std::sync::Mutex::new(SessionState::Connecting),
            error_count: AtomicU32::new(0),
            max_errors: settings.max_consecutive_errors.max(1),
            closed: AtomicBool::new(false),
            status: std::sync::Mutex::new(None),
        });
        let (jobs, queue) = mpsc::channel(JOB_QUEUE_DEPTH);
        tokio::spawn(run_job_queue(shared.clone(), queue));

        Self {
            shared,
            jobs,
            default_timeout: settings.execute_timeout,
            discovered,
        }
    }

    /// Canonical resource string.
    pub fn resource(&self) -> &str {
        &self.shared.resource
    }

    /// Current health.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Failures since the last success.
    pub fn error_count(&self) -> u32 {
        self.shared.error_count.load(Ordering::SeqCst)
    }

    /// True for sessions created by discovery; those are removed when their
    /// resource disappears.
    pub fn is_discovered(&self) -> bool {
        self.discovered
    }

    /// True once [`close`](Self::close) ran.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Application-defined status attached to the session.
    pub fn status(&self) -> Option<serde_json::Value> {
        self.shared
            .status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the status value.
    pub fn set_status(&self, status: serde_json::Value) {
        *self.shared.status.lock().unwrap_or_else(PoisonError::into_inner) = Some(status);
    }

    /// Run `operation` against the transport once every earlier job finished.
    ///
    /// `timeout` (default `session.execute_timeout`) bounds the whole call,
    /// including time spent queued or waiting for a reconnect. On expiry the
    /// job is skipped if it has not started yet.
    ///
    /// # Errors
    /// `SessionClosed` after [`close`](Self::close), `Timeout` on expiry,
    /// `NotOpen` when the session has no transport, otherwise the operation's error.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # async fn demo(session: &rust_visa::session::DeviceSession) -> rust_visa::error::VisaResult<()> {
    /// let reading = session
    ///     .execute(|t| Box::pin(async move { t.query("MEAS:VOLT?", None).await }), None)
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn execute<T, F>(&self, operation: F, timeout: Option<Duration>) -> VisaResult<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut dyn Transport) -> BoxFuture<'a, VisaResult<T>> + Send + 'static,
    {
        if self.is_closed() {
            return Err(VisaError::SessionClosed(self.shared.resource.clone()));
        }

        let limit = timeout.unwrap_or(self.default_timeout);
        let (reply_tx, reply_rx) = oneshot::channel();
        let queued = job(move |transport| {
            Box::pin(async move {
                if reply_tx.is_closed() {
                    return;
                }
                let result = match transport {
                    Some(transport) => operation(transport).await,
                    None => Err(VisaError::NotOpen),
                };
                let _ = reply_tx.send(result);
            })
        });

        let resource = self.shared.resource.clone();
        let outcome = tokio::time::timeout(limit, async {
            if self.jobs.send(queued).await.is_err() {
                return Err(VisaError::SessionClosed(resource.clone()));
            }
            match reply_rx.await {
                Ok(result) => result,
                Err(_) => Err(VisaError::SessionClosed(resource.clone())),
            }
        })
        .await
        .unwrap_or(Err(VisaError::Timeout(limit)));

        self.shared.record(&outcome);
        outcome
    }

    /// Write `command` and read the reply.
    pub async fn query(&self, command: &str) -> VisaResult<String> {
        let command = command.to_string();
        self.execute(
            move |t| Box::pin(async move { t.query(&command, None).await }),
            None,
        )
        .await
    }

    /// Write `command` without reading.
    pub async fn write(&self, command: &str) -> VisaResult<()> {
        let command = command.to_string();
        self.execute(move |t| Box::pin(async move { t.write(&command).await }), None)
            .await
    }

    /// Close and reopen the transport.
    ///
    /// Queued jobs wait until this finishes. On failure the session stays
    /// disconnected if it was, and enters `Error` otherwise.
    pub async fn reconnect(&self) -> VisaResult<()> {
        self.shared.reconnect().await
    }

    pub(crate) fn mark_disconnected(&self) {
        self.shared.set_state(SessionState::Disconnected);
    }

    /// Close the transport and refuse further work.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut slot = self.shared.transport.lock().await;
        if slot.take().is_some() {
            if let Err(e) = self.shared.resources.close(&self.shared.resource).await {
                warn!(resource = %self.shared.resource, error = %e, "Closing session transport failed");
            }
        }
        drop(slot);
        self.shared.set_state(SessionState::Disconnected);
        debug!(resource = %self.shared.resource, "Session closed");
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("resource", &self.shared.resource)
            .field("state", &self.state())
            .field("error_count", &self.error_count())
            .field("discovered", &self.discovered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::simulated::HandlerReply;
    use crate::transport::usbtmc::testing::{FakeConnector, FakeInstrument};

    const RESOURCE: &str = "SIM::psu::INSTR";

    struct Bench {
        session: DeviceSession,
        broken: Arc<AtomicBool>,
        commands: Arc<std::sync::Mutex<Vec<String>>>,
    }

    async fn bench(max_errors: u32) -> Bench {
        let broken = Arc::new(AtomicBool::new(false));
        let commands = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (flag, log) = (broken.clone(), commands.clone());

        let resources = Arc::new(ResourceManager::default());
        resources.register_simulated(
            "psu",
            Arc::new(move |cmd: &str| {
                log.lock().unwrap().push(cmd.to_string());
                if flag.load(Ordering::SeqCst) {
                    HandlerReply::unmatched()
                } else if cmd.ends_with('?') {
                    HandlerReply::respond("1")
                } else {
                    HandlerReply::ack()
                }
            }),
        );

        let settings = SessionSettings {
            max_consecutive_errors: max_errors,
            ..SessionSettings::default()
        };
        let session = DeviceSession::new(
            RESOURCE.into(),
            false,
            resources,
            Arc::new(EventRegistry::new()),
            &settings,
        );
        session.reconnect().await.unwrap();
        Bench {
            session,
            broken,
            commands,
        }
    }

    #[tokio::test]
    async fn test_connect_and_query() {
        let bench = bench(3).await;
        assert_eq!(bench.session.state(), SessionState::Connected);
        assert_eq!(bench.session.query("*OPC?").await.unwrap(), "1");
    }

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let bench = bench(3).await;
        let s = &bench.session;
        let (a, b, c) = tokio::join!(s.write("A"), s.write("B"), s.write("C"));
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(*bench.commands.lock().unwrap(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_errors_escalate_and_success_resets() {
        let bench = bench(3).await;
        bench.broken.store(true, Ordering::SeqCst);

        for expected in 1..=2 {
            assert!(bench.session.query("MEAS?").await.is_err());
            assert_eq!(bench.session.error_count(), expected);
            assert_eq!(bench.session.state(), SessionState::Connected);
        }
        assert!(bench.session.query("MEAS?").await.is_err());
        assert_eq!(bench.session.state(), SessionState::Error);

        bench.broken.store(false, Ordering::SeqCst);
        assert_eq!(bench.session.query("MEAS?").await.unwrap(), "1");
        assert_eq!(bench.session.error_count(), 0);
        assert_eq!(bench.session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_execute_timeout_counts_as_failure() {
        let bench = bench(3).await;
        let result: VisaResult<()> = bench
            .session
            .execute(
                |_t| {
                    Box::pin(async move {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(())
                    })
                },
                Some(Duration::from_millis(20)),
            )
            .await;
        assert!(matches!(result, Err(VisaError::Timeout(_))));
        assert_eq!(bench.session.error_count(), 1);
    }

    #[tokio::test]
    async fn test_reconnect_resets_counter() {
        let bench = bench(2).await;
        bench.broken.store(true, Ordering::SeqCst);
        let _ = bench.session.query("MEAS?").await;
        let _ = bench.session.query("MEAS?").await;
        assert_eq!(bench.session.state(), SessionState::Error);

        bench.broken.store(false, Ordering::SeqCst);
        bench.session.reconnect().await.unwrap();
        assert_eq!(bench.session.state(), SessionState::Connected);
        assert_eq!(bench.session.error_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_work() {
        let bench = bench(3).await;
        bench.session.close().await;
        assert_eq!(bench.session.state(), SessionState::Disconnected);
        assert!(matches!(
            bench.session.query("*OPC?").await,
            Err(VisaError::SessionClosed(_))
        ));
        assert!(matches!(
            bench.session.reconnect().await,
            Err(VisaError::SessionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_status_roundtrip() {
        let bench = bench(3).await;
        assert!(bench.session.status().is_none());
        bench
            .session
            .set_status(serde_json::json!({ "output": true, "volts": 5.0 }));
        assert_eq!(bench.session.status().unwrap()["volts"], 5.0);
    }

    #[tokio::test]
    async fn test_execute_waits_for_reconnect_within_its_timeout() {
        let device = FakeInstrument::new().reply(b"1\n");
        let connector = FakeConnector::slow(device, Duration::from_millis(300));
        let resources = Arc::new(ResourceManager::default().with_usb_connector(connector));
        let session = DeviceSession::new(
            "USB0::0x0957::0x1796::MY123::INSTR".into(),
            false,
            resources,
            Arc::new(EventRegistry::new()),
            &SessionSettings::default(),
        );
        fn opc(t: &mut dyn Transport) -> BoxFuture<'_, VisaResult<String>> {
            Box::pin(async move { t.query("*OPC?", None).await })
        }

        let (connected, (impatient, errors_after_timeout), patient) = tokio::join!(
            session.reconnect(),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                let result = session.execute(opc, Some(Duration::from_millis(50))).await;
                (result, session.error_count())
            },
            async {
                tokio::time::sleep(Duration::from_millis(30)).await;
                session.execute(opc, Some(Duration::from_secs(2))).await
            },
        );

        connected.unwrap();
        assert!(matches!(impatient, Err(VisaError::Timeout(_))));
        assert_eq!(errors_after_timeout, 1);
        assert_eq!(patient.unwrap(), "1");
        assert_eq!(session.error_count(), 0);
        assert_eq!(session.state(), SessionState::Connected);
    }
}
