use crate::config::ConnectionPoolConfig;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use toolmesh_common::{Connection, ConnectionFactory, Result, ToolmeshError};
use tracing::{debug, error, info, warn};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(0);

const STATE_EVENT_CAPACITY: usize = 64;

/// Lifecycle state of a [`PooledConnection`].
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Error -> Reconnecting -> Connected
///                                                               \-> Error
/// any non-terminal state -> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Error = 4,
    Closed = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Reconnecting,
            4 => ConnectionState::Error,
            _ => ConnectionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Closed => "closed",
        }
    }

    /// Whether `self -> next` is an edge of the state graph.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected | Error) => true,
            (Connected, Error | Reconnecting) => true,
            (Reconnecting, Connected | Error) => true,
            (Error, Connecting | Reconnecting) => true,
            _ => false,
        }
    }

    /// Dead connections are swept by the pool regardless of minimums.
    pub fn is_dead(self) -> bool {
        matches!(self, ConnectionState::Error | ConnectionState::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change broadcast to [`PooledConnection::subscribe`] receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Serializable description of a connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub server_id: String,
    pub state: ConnectionState,
    pub use_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub last_error: Option<String>,
}

struct ConnectionInner {
    raw: Option<Arc<dyn Connection>>,
    last_used: Instant,
    last_error: Option<String>,
    monitor: Option<CancellationToken>,
}

/// One physical connection to a server, owned by that server's pool.
///
/// The state lives in an atomic so readers never block. Everything else that
/// changes after construction sits behind a short-lived mutex. `connect` is
/// serialized by an async mutex so reconnection and explicit connects never
/// race each other into the factory.
pub struct PooledConnection {
    id: String,
    server_id: String,
    created_at: Instant,
    state: AtomicU8,
    use_count: AtomicU64,
    inner: Mutex<ConnectionInner>,
    connect_lock: tokio::sync::Mutex<()>,
    factory: Arc<dyn ConnectionFactory>,
    config: Arc<ConnectionPoolConfig>,
    lifecycle: CancellationToken,
    tracker: TaskTracker,
    events: broadcast::Sender<StateChange>,
}

impl PooledConnection {
    /// Creates a disconnected connection.
    ///
    /// Background work (health monitor, reconnection) is spawned on `tracker`
    /// and stops when `parent` is cancelled or the connection is disconnected.
    pub fn new(
        server_id: impl Into<String>,
        factory: Arc<dyn ConnectionFactory>,
        config: Arc<ConnectionPoolConfig>,
        parent: &CancellationToken,
        tracker: TaskTracker,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(STATE_EVENT_CAPACITY);
        let now = Instant::now();
        Arc::new(Self {
            id: generate_connection_id(),
            server_id: server_id.into(),
            created_at: now,
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            use_count: AtomicU64::new(0),
            inner: Mutex::new(ConnectionInner {
                raw: None,
                last_used: now,
                last_error: None,
                monitor: None,
            }),
            connect_lock: tokio::sync::Mutex::new(()),
            factory,
            config,
            lifecycle: parent.child_token(),
            tracker,
            events,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::Relaxed)
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.inner.lock().last_used
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.lock().last_error.clone()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used().elapsed()
    }

    /// Receives every subsequent state change of this connection.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    pub fn info(&self) -> ConnectionInfo {
        let inner = self.inner.lock();
        ConnectionInfo {
            id: self.id.clone(),
            server_id: self.server_id.clone(),
            state: self.state(),
            use_count: self.use_count(),
            age_ms: self.created_at.elapsed().as_millis() as u64,
            idle_ms: inner.last_used.elapsed().as_millis() as u64,
            last_error: inner.last_error.clone(),
        }
    }

    fn transition(&self, to: ConnectionState) -> bool {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let from = ConnectionState::from_u8(current);
            if !from.can_transition_to(to) {
                return false;
            }
            match self
                .state
                .compare_exchange(current, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.announce(from, to);
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn transition_from(&self, from: ConnectionState, to: ConnectionState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        let swapped = self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            self.announce(from, to);
        }
        swapped
    }

    fn announce(&self, from: ConnectionState, to: ConnectionState) {
        debug!(conn = %self.id, server_id = %self.server_id, %from, %to, "connection state changed");
        // no receivers is fine
        let _ = self.events.send(StateChange { from, to });
    }

    fn record_error(&self, message: String) {
        self.inner.lock().last_error = Some(message);
    }

    /// Establishes the underlying connection through the factory.
    ///
    /// A no-op when already connected. On success the health monitor is
    /// (re)started. Factory creation is bounded by `connection_timeout`.
    ///
    /// # Errors
    ///
    /// - `ConnectionClosed` if the connection was disconnected
    /// - `Cancelled` if the owning pool shuts down meanwhile
    /// - `ConnectionCreation` wrapping the factory failure otherwise
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _serialized = self.connect_lock.lock().await;

        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Closed => return Err(ToolmeshError::ConnectionClosed(self.id.clone())),
            ConnectionState::Reconnecting => {}
            _ => {
                self.transition(ConnectionState::Connecting);
            }
        }

        let timeout = self.config.connection_timeout;
        let created = tokio::select! {
            _ = self.lifecycle.cancelled() => Err(ToolmeshError::Cancelled),
            created = tokio::time::timeout(timeout, self.factory.create_connection(&self.server_id)) => {
                created.unwrap_or(Err(ToolmeshError::ConnectionTimeout(timeout.as_millis() as u64)))
            }
        };

        let raw = match created {
            Ok(raw) => raw,
            Err(ToolmeshError::Cancelled) => return Err(ToolmeshError::Cancelled),
            Err(e) => {
                self.record_error(e.to_string());
                self.transition(ConnectionState::Error);
                return Err(ToolmeshError::ConnectionCreation {
                    server_id: self.server_id.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let stale = self.inner.lock().raw.replace(Arc::clone(&raw));
        if let Some(stale) = stale {
            if let Err(e) = stale.close().await {
                debug!(conn = %self.id, error = %e, "failed to close replaced connection");
            }
        }

        if !self.transition(ConnectionState::Connected) {
            // disconnected while the factory was working
            self.inner.lock().raw = None;
            let _ = raw.close().await;
            return Err(ToolmeshError::ConnectionClosed(self.id.clone()));
        }

        let monitor = self.lifecycle.child_token();
        let previous = {
            let mut inner = self.inner.lock();
            inner.last_error = None;
            inner.last_used = Instant::now();
            inner.monitor.replace(monitor.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
        self.spawn_health_monitor(monitor);

        info!(conn = %self.id, server_id = %self.server_id, "connection established");
        Ok(())
    }

    /// Probes the connection. Never true unless the state is `Connected`.
    pub async fn is_healthy(&self) -> bool {
        if self.state() != ConnectionState::Connected {
            return false;
        }
        let Some(raw) = self.inner.lock().raw.clone() else {
            return false;
        };

        let timeout = self.config.health_check_timeout;
        match tokio::time::timeout(timeout, raw.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                self.record_error(e.to_string());
                false
            }
            Err(_) => {
                self.record_error(format!("health check timed out after {}ms", timeout.as_millis()));
                false
            }
        }
    }

    /// Marks the connection as used and hands out the raw handle.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionClosed` unless the connection is `Connected`.
    pub fn use_handle(&self) -> Result<Arc<dyn Connection>> {
        if self.state() != ConnectionState::Connected {
            return Err(ToolmeshError::ConnectionClosed(self.id.clone()));
        }
        let mut inner = self.inner.lock();
        let raw = inner
            .raw
            .clone()
            .ok_or_else(|| ToolmeshError::ConnectionClosed(self.id.clone()))?;
        inner.last_used = Instant::now();
        self.use_count.fetch_add(1, Ordering::Relaxed);
        Ok(raw)
    }

    /// Closes the connection for good and stops its background work.
    pub async fn disconnect(&self) {
        if !self.transition(ConnectionState::Closed) {
            return;
        }
        self.lifecycle.cancel();

        let raw = {
            let mut inner = self.inner.lock();
            inner.monitor = None;
            inner.raw.take()
        };
        if let Some(raw) = raw {
            if let Err(e) = raw.close().await {
                warn!(conn = %self.id, server_id = %self.server_id, error = %e, "error closing connection");
            }
        }
        debug!(conn = %self.id, server_id = %self.server_id, "connection closed");
    }

    fn spawn_health_monitor(self: &Arc<Self>, token: CancellationToken) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.health_check_interval;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(conn) = weak.upgrade() else { break };
                if conn.state() != ConnectionState::Connected || conn.is_healthy().await {
                    continue;
                }

                if conn.transition_from(ConnectionState::Connected, ConnectionState::Error) {
                    let reason = conn.last_error().unwrap_or_default();
                    warn!(
                        conn = %conn.id,
                        server_id = %conn.server_id,
                        error = %reason,
                        "health check failed, reconnecting"
                    );
                    let reconnecting = Arc::clone(&conn);
                    conn.tracker.spawn(async move { reconnecting.attempt_reconnection().await });
                }
            }
        });
    }

    async fn attempt_reconnection(self: Arc<Self>) {
        let mut backoff = self.config.reconnect_backoff;
        let max_attempts = self.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            if !self.transition_from(ConnectionState::Error, ConnectionState::Reconnecting) {
                return;
            }

            tokio::select! {
                _ = self.lifecycle.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }

            match self.connect().await {
                Ok(()) => {
                    info!(conn = %self.id, server_id = %self.server_id, attempt, "reconnected");
                    return;
                }
                Err(ToolmeshError::Cancelled) | Err(ToolmeshError::ConnectionClosed(_)) => return,
                Err(e) => {
                    warn!(
                        conn = %self.id,
                        server_id = %self.server_id,
                        attempt,
                        max_attempts,
                        error = %e,
                        "reconnection attempt failed"
                    );
                    backoff = self.config.next_reconnect_backoff(backoff);
                }
            }
        }

        error!(
            conn = %self.id,
            server_id = %self.server_id,
            attempts = max_attempts,
            "reconnection attempts exhausted"
        );
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("server_id", &self.server_id)
            .field("state", &self.state())
            .field("use_count", &self.use_count())
            .finish()
    }
}

fn generate_connection_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let counter = CONNECTION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("conn_{}_{}", timestamp, counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32};

    struct FlakyConnection {
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for FlakyConnection {
        async fn ping(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ToolmeshError::Probe("connection reset by peer".into()))
            }
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    struct TestFactory {
        healthy: Arc<AtomicBool>,
        fail_creates: AtomicU32,
        creates: AtomicU32,
    }

    impl TestFactory {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                healthy: Arc::new(AtomicBool::new(true)),
                fail_creates: AtomicU32::new(0),
                creates: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl ConnectionFactory for TestFactory {
        async fn create_connection(&self, server_id: &str) -> Result<Arc<dyn Connection>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            let remaining_failures = self.fail_creates.load(Ordering::SeqCst);
            if remaining_failures > 0 {
                self.fail_creates.fetch_sub(1, Ordering::SeqCst);
                return Err(ToolmeshError::Execution(format!("connection refused by {}", server_id)));
            }
            Ok(Arc::new(FlakyConnection { healthy: Arc::clone(&self.healthy) }))
        }
    }

    fn config() -> Arc<ConnectionPoolConfig> {
        Arc::new(
            ConnectionPoolConfig::default()
                .with_health_check(Duration::from_secs(1), Duration::from_millis(100))
                .with_reconnect(Duration::from_millis(100), Duration::from_secs(1), 3),
        )
    }

    fn connection(factory: Arc<TestFactory>) -> Arc<PooledConnection> {
        PooledConnection::new("s1", factory, config(), &CancellationToken::new(), TaskTracker::new())
    }

    #[test]
    fn test_state_graph() {
        use ConnectionState::*;
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connected.can_transition_to(Error));
        assert!(Error.can_transition_to(Reconnecting));
        assert!(Reconnecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Closed));
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connecting.can_transition_to(Reconnecting));
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
        assert_eq!(ConnectionState::from_u8(ConnectionState::Error as u8), ConnectionState::Error);
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let factory = TestFactory::new();
        let a = connection(Arc::clone(&factory));
        let b = connection(factory);
        assert_ne!(a.id(), b.id());
        assert!(a.id().starts_with("conn_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_and_use() {
        let factory = TestFactory::new();
        let conn = connection(Arc::clone(&factory));

        assert!(conn.use_handle().is_err());
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);

        // second connect is a no-op
        conn.connect().await.unwrap();
        assert_eq!(factory.creates.load(Ordering::SeqCst), 1);

        conn.use_handle().unwrap();
        conn.use_handle().unwrap();
        assert_eq!(conn.use_count(), 2);
        assert!(conn.is_healthy().await);

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.connect().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_sets_error() {
        let factory = TestFactory::new();
        factory.fail_creates.store(1, Ordering::SeqCst);
        let conn = connection(factory);

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ToolmeshError::ConnectionCreation { ref server_id, .. } if server_id == "s1"));
        assert_eq!(conn.state(), ConnectionState::Error);
        assert!(conn.last_error().unwrap().contains("connection refused"));

        // an explicit connect from Error may succeed
        conn.connect().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert!(conn.last_error().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_connection_is_not_healthy() {
        let factory = TestFactory::new();
        let conn = connection(Arc::clone(&factory));
        conn.connect().await.unwrap();

        factory.healthy.store(false, Ordering::SeqCst);
        assert!(!conn.is_healthy().await);
        assert!(conn.last_error().unwrap().contains("connection reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnection_exhausts_into_error() {
        let factory = TestFactory::new();
        let conn = connection(Arc::clone(&factory));
        conn.connect().await.unwrap();
        let mut events = conn.subscribe();

        factory.healthy.store(false, Ordering::SeqCst);
        factory.fail_creates.store(u32::MAX, Ordering::SeqCst);

        // health interval 1s, then backoffs 100ms + 150ms + 225ms
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(conn.state(), ConnectionState::Error);
        // 1 initial create + 3 reconnection attempts
        assert_eq!(factory.creates.load(Ordering::SeqCst), 4);

        let mut reconnecting = 0;
        while let Ok(change) = events.try_recv() {
            if change.to == ConnectionState::Reconnecting {
                reconnecting += 1;
            }
        }
        assert_eq!(reconnecting, 3);
    }
}
