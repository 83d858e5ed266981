//! Per-resource event stream lifecycle.
//!
//! The registry owns at most one live subscription to the Infisical event
//! stream. It swaps the connection when subscription parameters change,
//! watches stream health, and reconnects with exponential backoff. The
//! coordinator talks to it through three callbacks (`on_event`, `on_error`,
//! `on_reconnect`); the registry never calls back into the coordinator's
//! types directly.

use crate::error::Error;
use crate::sse::parser::{Event, EventParser};
use futures::future::BoxFuture;
use futures::StreamExt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Parameters identifying one subscription. Two values are equal iff all
/// three fields match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionParams {
    pub project_id: String,
    pub env_slug: String,
    pub secrets_path: String,
}

/// Operation producing a fresh HTTP response against the subscribe endpoint.
/// Stored so the registry can reconnect on its own.
pub type OpenFn =
    Arc<dyn Fn() -> BoxFuture<'static, Result<reqwest::Response, Error>> + Send + Sync>;

/// Callbacks wired in by the coordinator. They run on registry tasks and are
/// isolated from panics.
pub struct RegistryCallbacks {
    pub on_event: Arc<dyn Fn(Event) + Send + Sync>,
    pub on_error: Arc<dyn Fn(&Error) + Send + Sync>,
    /// Invoked once when reconnection attempts are exhausted. The coordinator
    /// uses this to force a full reconcile as a fallback.
    pub on_reconnect: Arc<dyn Fn() + Send + Sync>,
}

/// Reconnection and health-monitoring knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_factor: f64,
    pub health_check_interval: Duration,
    pub ping_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_factor: 2.0,
            health_check_interval: Duration::from_secs(30),
            ping_timeout: Duration::from_secs(120),
        }
    }
}

/// How long `close()` waits for registry tasks before giving up.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors that must never trigger reconnection.
pub fn is_permanent_error_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("not available on your current plan")
        || (message.contains("plan") && message.contains("not available"))
}

fn is_permanent(err: &Error) -> bool {
    matches!(err, Error::UpstreamPermanent(_)) || is_permanent_error_message(&err.to_string())
}

struct ConnectionMeta {
    params: SubscriptionParams,
    /// Child of the registry root; cancelling drops the reader's response
    /// stream, which closes the body and unblocks the read.
    cancel: CancellationToken,
    /// Milliseconds since registry start, refreshed on every received event.
    last_ping: Arc<AtomicU64>,
}

#[derive(Default)]
struct State {
    conn: Option<ConnectionMeta>,
    open: Option<OpenFn>,
}

struct Inner {
    state: Mutex<State>,
    root: CancellationToken,
    tasks: TaskTracker,
    config: RegistryConfig,
    callbacks: RegistryCallbacks,
    /// At most one reconnect loop may run per registry.
    reconnecting: AtomicBool,
    started: Instant,
}

/// Owns at most one live upstream event stream.
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new(callbacks: RegistryCallbacks) -> Self {
        Self::with_config(callbacks, RegistryConfig::default())
    }

    pub fn with_config(callbacks: RegistryCallbacks, config: RegistryConfig) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            root: CancellationToken::new(),
            tasks: TaskTracker::new(),
            config,
            callbacks,
            reconnecting: AtomicBool::new(false),
            started: Instant::now(),
        });

        let monitor = inner.clone();
        inner.tasks.spawn(async move { monitor.monitor_health().await });

        Self { inner }
    }

    /// Subscribe with parameter tracking. A live connection with identical
    /// params is left alone; otherwise the existing connection is closed and
    /// a new one opened. `open` is stored for reconnection.
    pub async fn subscribe_with_params(
        &self,
        params: SubscriptionParams,
        open: OpenFn,
    ) -> Result<(), Error> {
        let result = {
            let mut state = self.inner.state.lock().await;
            if self.inner.root.is_cancelled() {
                return Err(Error::Config("event stream registry is closed".to_string()));
            }
            if let Some(conn) = &state.conn {
                if conn.params == params && !conn.cancel.is_cancelled() {
                    return Ok(());
                }
                Inner::close_connection_locked(&mut state);
            }
            state.open = Some(open.clone());
            Inner::create_connection_locked(&self.inner, &mut state, params, open).await
        };

        if let Err(err) = &result {
            self.inner.emit_error(err);
        }
        result
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .conn
            .as_ref()
            .is_some_and(|conn| !conn.cancel.is_cancelled())
    }

    pub async fn get_params(&self) -> Option<SubscriptionParams> {
        let state = self.inner.state.lock().await;
        state.conn.as_ref().map(|conn| conn.params.clone())
    }

    /// Idempotent shutdown: close the connection (unblocking the reader),
    /// cancel the registry root, and wait for tasks with a bounded timeout.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock().await;
            Inner::close_connection_locked(&mut state);
        }
        self.inner.root.cancel();
        self.inner.tasks.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.inner.tasks.wait())
            .await
            .is_err()
        {
            warn!("timed out waiting for event stream tasks to stop");
        }
    }
}

impl Inner {
    fn now_millis(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn close_connection_locked(state: &mut State) {
        if let Some(conn) = state.conn.take() {
            conn.cancel.cancel();
        }
    }

    /// Open a connection and start its reader. Must be called with the state
    /// lock held.
    async fn create_connection_locked(
        inner: &Arc<Self>,
        state: &mut State,
        params: SubscriptionParams,
        open: OpenFn,
    ) -> Result<(), Error> {
        if inner.root.is_cancelled() {
            return Err(Error::Config("event stream registry is closed".to_string()));
        }

        let response = open().await?;

        let cancel = inner.root.child_token();
        let last_ping = Arc::new(AtomicU64::new(inner.now_millis()));
        state.conn = Some(ConnectionMeta {
            params,
            cancel: cancel.clone(),
            last_ping: last_ping.clone(),
        });

        let reader = inner.clone();
        inner.tasks.spawn(async move {
            reader.process_stream(cancel, response, last_ping).await;
        });

        Ok(())
    }

    /// Reader task: one per live connection. Parses the event stream, feeds
    /// pings into the health clock, and hands everything else to `on_event`.
    async fn process_stream(
        self: Arc<Self>,
        cancel: CancellationToken,
        response: reqwest::Response,
        last_ping: Arc<AtomicU64>,
    ) {
        let mut stream = response.bytes_stream();
        let mut parser = EventParser::new();

        loop {
            tokio::select! {
                // Cancellation drops the stream, closing the response body.
                _ = cancel.cancelled() => return,
                chunk = stream.next() => match chunk {
                    Some(Ok(chunk)) => {
                        for event in parser.push(&chunk) {
                            if cancel.is_cancelled() {
                                return;
                            }
                            last_ping.store(self.now_millis(), Ordering::Relaxed);
                            if event.is_ping() {
                                debug!("event stream keepalive");
                            } else {
                                self.emit_event(event);
                            }
                        }
                    }
                    Some(Err(err)) => {
                        if cancel.is_cancelled() {
                            return;
                        }
                        let message = err.to_string();
                        let lower = message.to_lowercase();
                        // Body teardown during an ordered shutdown is expected.
                        if lower.contains("closed") || lower.contains("eof") {
                            return;
                        }
                        if is_permanent_error_message(&message) {
                            self.emit_error(&Error::UpstreamPermanent(message));
                        } else {
                            self.emit_error(&Error::UpstreamTransient(message));
                            Inner::trigger_reconnect(&self).await;
                        }
                        return;
                    }
                    // Clean end of stream; the health monitor will notice the
                    // silence and reconnect.
                    None => return,
                }
            }
        }
    }

    /// Every tick, swap out a connection whose last event is older than the
    /// ping timeout and reconnect with its params.
    async fn monitor_health(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = tokio::time::sleep(self.config.health_check_interval) => {}
            }

            let stale = {
                let mut state = self.state.lock().await;
                let Some(conn) = &state.conn else { continue };
                let age = self.now_millis().saturating_sub(conn.last_ping.load(Ordering::Relaxed));
                if u128::from(age) <= self.config.ping_timeout.as_millis() {
                    continue;
                }
                let params = conn.params.clone();
                let open = state.open.clone();
                Self::close_connection_locked(&mut state);
                open.map(|open| (params, open))
            };

            if let Some((params, open)) = stale {
                warn!(
                    project_id = %params.project_id,
                    "event stream stale, no traffic within ping timeout; reconnecting"
                );
                Inner::spawn_reconnect(&self, params, open);
            }
        }
    }

    /// Reconnect with the current params after a reader failure.
    async fn trigger_reconnect(inner: &Arc<Self>) {
        if inner.root.is_cancelled() {
            return;
        }
        let (params, open) = {
            let state = inner.state.lock().await;
            let params = state
                .conn
                .as_ref()
                .map(|conn| conn.params.clone())
                .unwrap_or_default();
            (params, state.open.clone())
        };
        let Some(open) = open else { return };
        Inner::spawn_reconnect(inner, params, open);
    }

    fn spawn_reconnect(inner: &Arc<Self>, params: SubscriptionParams, open: OpenFn) {
        if inner.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let task = inner.clone();
        inner.tasks.spawn(async move {
            Inner::reconnect_loop(&task, params, open).await;
            task.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    /// Exponential backoff reconnection. Success installs the connection;
    /// permanent errors abort; exhaustion invokes `on_reconnect` once.
    async fn reconnect_loop(inner: &Arc<Self>, params: SubscriptionParams, open: OpenFn) {
        let mut backoff = inner.config.initial_backoff;

        for attempt in 1..=inner.config.max_retries {
            tokio::select! {
                _ = inner.root.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            let result = {
                let mut state = inner.state.lock().await;
                Inner::create_connection_locked(inner, &mut state, params.clone(), open.clone())
                    .await
            };

            match result {
                Ok(()) => {
                    info!(attempt, "event stream reconnected");
                    return;
                }
                Err(err) if is_permanent(&err) => {
                    inner.emit_error(&err);
                    return;
                }
                Err(err) => {
                    inner.emit_error(&Error::UpstreamTransient(format!(
                        "reconnect attempt {attempt} failed: {err}"
                    )));
                    backoff = Duration::from_secs_f64(
                        (backoff.as_secs_f64() * inner.config.backoff_factor)
                            .min(inner.config.max_backoff.as_secs_f64()),
                    );
                }
            }
        }

        inner.emit_reconnect();
    }

    // Callbacks cross a trust boundary; a panicking callback must not take a
    // registry task down with it.

    fn emit_event(&self, event: Event) {
        let on_event = self.callbacks.on_event.clone();
        if catch_unwind(AssertUnwindSafe(|| on_event(event))).is_err() {
            error!("on_event callback panicked");
        }
    }

    fn emit_error(&self, err: &Error) {
        let on_error = self.callbacks.on_error.clone();
        if catch_unwind(AssertUnwindSafe(|| on_error(err))).is_err() {
            error!("on_error callback panicked");
        }
    }

    fn emit_reconnect(&self) {
        let on_reconnect = self.callbacks.on_reconnect.clone();
        if catch_unwind(AssertUnwindSafe(|| on_reconnect())).is_err() {
            error!("on_reconnect callback panicked");
        }
    }
}
