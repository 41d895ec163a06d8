use crate::config::ConnectionPoolConfig;
use crate::connection::{ConnectionState, PooledConnection};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use toolmesh_common::{ConnectionFactory, Result, ToolmeshError};
use tracing::{debug, info, warn};

/// Connection counts for one server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerPoolStats {
    /// Live connections tracked by the pool, idle or checked out
    pub total: usize,
    /// Connections waiting in the idle queue
    pub available: usize,
    /// Connections currently checked out
    pub active: usize,
}

/// Snapshot of the whole pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub total_servers: usize,
    pub total_connections: usize,
    pub available_connections: usize,
    pub active_connections: usize,
    pub servers: BTreeMap<String, ServerPoolStats>,
}

#[derive(Default)]
struct Tracked {
    connections: Vec<Arc<PooledConnection>>,
    /// Creations in flight, counted against the ceiling
    pending: usize,
}

/// Holds a creation slot until dropped, so a cancelled `get_connection`
/// never leaks capacity.
struct SlotReservation<'a> {
    pool: &'a ServerPool,
}

impl Drop for SlotReservation<'_> {
    fn drop(&mut self) {
        let mut tracked = self.pool.tracked.lock();
        tracked.pending = tracked.pending.saturating_sub(1);
    }
}

/// The connections of one server.
///
/// Idle connections wait in a FIFO queue bounded by `max_connections`;
/// `returned` wakes callers blocked in `get_connection` whenever a connection
/// comes back or capacity frees up.
struct ServerPool {
    server_id: String,
    config: Arc<ConnectionPoolConfig>,
    factory: Arc<dyn ConnectionFactory>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    tracked: Mutex<Tracked>,
    idle: Mutex<VecDeque<Arc<PooledConnection>>>,
    returned: Notify,
}

impl ServerPool {
    fn reserve_slot(&self) -> Result<SlotReservation<'_>> {
        let mut tracked = self.tracked.lock();
        if tracked.connections.len() + tracked.pending >= self.config.max_connections {
            return Err(ToolmeshError::PoolExhausted {
                server_id: self.server_id.clone(),
                max: self.config.max_connections,
            });
        }
        tracked.pending += 1;
        Ok(SlotReservation { pool: self })
    }

    async fn create_connection(&self) -> Result<Arc<PooledConnection>> {
        let reservation = self.reserve_slot()?;
        let conn = PooledConnection::new(
            self.server_id.clone(),
            Arc::clone(&self.factory),
            Arc::clone(&self.config),
            &self.shutdown,
            self.tracker.clone(),
        );

        if let Err(e) = conn.connect().await {
            conn.disconnect().await;
            return Err(e);
        }

        self.tracked.lock().connections.push(Arc::clone(&conn));
        drop(reservation);
        debug!(server_id = %self.server_id, conn = %conn.id(), "created pooled connection");
        Ok(conn)
    }

    fn pop_idle(&self) -> Option<Arc<PooledConnection>> {
        self.idle.lock().pop_front()
    }

    fn is_tracked(&self, conn: &Arc<PooledConnection>) -> bool {
        self.tracked
            .lock()
            .connections
            .iter()
            .any(|c| Arc::ptr_eq(c, conn))
    }

    /// Puts a connection back in the idle queue. Returns it if the queue is full.
    fn push_idle(&self, conn: Arc<PooledConnection>) -> Option<Arc<PooledConnection>> {
        let mut idle = self.idle.lock();
        if idle.iter().any(|c| Arc::ptr_eq(c, &conn)) {
            return None;
        }
        if idle.len() >= self.config.max_connections {
            return Some(conn);
        }
        idle.push_back(conn);
        drop(idle);
        self.returned.notify_one();
        None
    }

    fn forget(&self, conn: &Arc<PooledConnection>) {
        self.tracked.lock().connections.retain(|c| !Arc::ptr_eq(c, conn));
        self.idle.lock().retain(|c| !Arc::ptr_eq(c, conn));
    }

    async fn discard(&self, conn: &Arc<PooledConnection>) {
        self.forget(conn);
        conn.disconnect().await;
        self.returned.notify_one();
    }

    async fn get_connection(&self, cancel: &CancellationToken) -> Result<Arc<PooledConnection>> {
        let timeout = self.config.connection_timeout;
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.returned.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            while let Some(conn) = self.pop_idle() {
                if conn.is_healthy().await {
                    return Ok(conn);
                }
                debug!(server_id = %self.server_id, conn = %conn.id(), "discarding unhealthy idle connection");
                self.discard(&conn).await;
            }

            let created = tokio::select! {
                _ = cancel.cancelled() => return Err(ToolmeshError::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ToolmeshError::ConnectionTimeout(timeout.as_millis() as u64));
                }
                created = self.create_connection() => created,
            };
            match created {
                Ok(conn) => return Ok(conn),
                Err(ToolmeshError::PoolExhausted { .. }) => {}
                Err(e) => return Err(e),
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ToolmeshError::Cancelled),
                _ = self.shutdown.cancelled() => return Err(ToolmeshError::PoolClosed),
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(ToolmeshError::ConnectionTimeout(timeout.as_millis() as u64));
                }
                _ = &mut notified => {}
            }
        }
    }

    async fn ensure_min_connections(&self) {
        let needed = {
            let tracked = self.tracked.lock();
            self.config
                .min_connections
                .saturating_sub(tracked.connections.len() + tracked.pending)
        };

        for _ in 0..needed {
            let created = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                created = self.create_connection() => created,
            };
            match created {
                Ok(conn) => {
                    if let Some(overflow) = self.push_idle(conn) {
                        self.discard(&overflow).await;
                    }
                }
                Err(ToolmeshError::PoolExhausted { .. }) => return,
                Err(e) => {
                    warn!(server_id = %self.server_id, error = %e, "failed to seed pool connection");
                    return;
                }
            }
        }
    }

    /// Drops dead connections, and idle ones past their age or idle limit as
    /// long as `min_connections` live connections remain.
    async fn cleanup(&self) -> usize {
        let doomed = {
            let mut tracked = self.tracked.lock();
            let mut idle = self.idle.lock();

            let mut doomed: Vec<Arc<PooledConnection>> = Vec::new();
            tracked.connections.retain(|c| {
                if c.state().is_dead() {
                    doomed.push(Arc::clone(c));
                    false
                } else {
                    true
                }
            });

            let expired: Vec<Arc<PooledConnection>> = idle
                .iter()
                .filter(|c| {
                    c.age() >= self.config.max_connection_age
                        || c.idle_time() >= self.config.max_idle_time
                })
                .cloned()
                .collect();
            let removable = tracked
                .connections
                .len()
                .saturating_sub(self.config.min_connections);

            for conn in expired.into_iter().take(removable) {
                tracked.connections.retain(|c| !Arc::ptr_eq(c, &conn));
                doomed.push(conn);
            }
            idle.retain(|c| !doomed.iter().any(|d| Arc::ptr_eq(c, d)));
            doomed
        };

        for conn in &doomed {
            conn.disconnect().await;
        }
        if !doomed.is_empty() {
            self.returned.notify_waiters();
        }
        doomed.len()
    }

    fn stats(&self) -> ServerPoolStats {
        let total = self.tracked.lock().connections.len();
        let available = self.idle.lock().len();
        ServerPoolStats {
            total,
            available,
            active: total.saturating_sub(available),
        }
    }

    fn drain(&self) -> Vec<Arc<PooledConnection>> {
        self.idle.lock().clear();
        std::mem::take(&mut self.tracked.lock().connections)
    }
}

/// Per-server pools of health-monitored connections.
///
/// # Architecture
///
/// - Connections are grouped by server id, each group bounded by `max_connections`
/// - The first request for a server seeds `min_connections` in the background
/// - Idle connections are reused in FIFO order and health-checked on checkout
/// - Every connection runs its own health monitor and reconnects on failure
/// - A cleanup loop started by [`start`](Self::start) reaps dead and stale connections
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
/// use toolmesh_common::ConnectionFactory;
/// use toolmesh_pool::{ConnectionPool, ConnectionPoolConfig};
///
/// # async fn example(factory: Arc<dyn ConnectionFactory>) -> toolmesh_common::Result<()> {
/// let pool = ConnectionPool::new(ConnectionPoolConfig::default(), factory)?;
/// pool.start();
///
/// let conn = pool.get_connection(&CancellationToken::new(), "search-1").await?;
/// let handle = conn.use_handle()?;
/// // drive the protocol exchange over `handle`...
/// pool.return_connection(conn).await;
///
/// pool.close().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    config: Arc<ConnectionPoolConfig>,
    factory: Arc<dyn ConnectionFactory>,
    servers: Arc<RwLock<HashMap<String, Arc<ServerPool>>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

impl ConnectionPool {
    /// Creates a new connection pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration fails validation.
    pub fn new(config: ConnectionPoolConfig, factory: Arc<dyn ConnectionFactory>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            factory,
            servers: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &ConnectionPoolConfig {
        &self.config
    }

    /// Starts the periodic cleanup loop. Calling it again has no effect.
    pub fn start(&self) {
        if self.shutdown.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let servers = Arc::clone(&self.servers);
        let shutdown = self.shutdown.clone();
        let interval = self.config.cleanup_interval;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cleanup_servers(&servers).await;
                        if removed > 0 {
                            info!(removed, "cleaned up pooled connections");
                        }
                    }
                }
            }
        });
    }

    fn server_pool(&self, server_id: &str) -> Result<Arc<ServerPool>> {
        if self.shutdown.is_cancelled() {
            return Err(ToolmeshError::PoolClosed);
        }
        if let Some(pool) = self.servers.read().get(server_id) {
            return Ok(Arc::clone(pool));
        }

        let mut servers = self.servers.write();
        if let Some(pool) = servers.get(server_id) {
            return Ok(Arc::clone(pool));
        }

        let pool = Arc::new(ServerPool {
            server_id: server_id.to_string(),
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.factory),
            shutdown: self.shutdown.clone(),
            tracker: self.tracker.clone(),
            tracked: Mutex::new(Tracked::default()),
            idle: Mutex::new(VecDeque::new()),
            returned: Notify::new(),
        });
        servers.insert(server_id.to_string(), Arc::clone(&pool));
        drop(servers);

        info!(server_id, min = self.config.min_connections, "created server pool");
        if self.config.min_connections > 0 {
            let seeding = Arc::clone(&pool);
            self.tracker.spawn(async move { seeding.ensure_min_connections().await });
        }
        Ok(pool)
    }

    /// Checks out a healthy connection to `server_id`.
    ///
    /// Reuses an idle connection when one passes its health check, otherwise
    /// creates one if the server is below `max_connections`, otherwise waits
    /// for a connection to be returned.
    ///
    /// # Errors
    ///
    /// - `ConnectionCreation` if the factory fails
    /// - `ConnectionTimeout` if nothing became available within `connection_timeout`
    /// - `Cancelled` if `cancel` fires first
    /// - `PoolClosed` after [`close`](Self::close)
    pub async fn get_connection(
        &self,
        cancel: &CancellationToken,
        server_id: &str,
    ) -> Result<Arc<PooledConnection>> {
        let pool = self.server_pool(server_id)?;
        pool.get_connection(cancel).await
    }

    /// Gives a checked-out connection back to its pool.
    ///
    /// Connections that are no longer `Connected`, that the pool no longer
    /// tracks, or that do not fit in the idle queue are disconnected instead.
    pub async fn return_connection(&self, conn: Arc<PooledConnection>) {
        let pool = self.servers.read().get(conn.server_id()).cloned();
        let Some(pool) = pool else {
            conn.disconnect().await;
            return;
        };

        if conn.state() != ConnectionState::Connected || !pool.is_tracked(&conn) {
            debug!(conn = %conn.id(), state = %conn.state(), "not returning connection to pool");
            pool.discard(&conn).await;
            return;
        }

        if let Some(overflow) = pool.push_idle(conn) {
            pool.discard(&overflow).await;
        }
    }

    /// Runs one cleanup pass over every server. Returns the number of connections removed.
    pub async fn cleanup(&self) -> usize {
        cleanup_servers(&self.servers).await
    }

    pub fn stats(&self) -> PoolStats {
        let snapshot: Vec<(String, Arc<ServerPool>)> = self
            .servers
            .read()
            .iter()
            .map(|(id, pool)| (id.clone(), Arc::clone(pool)))
            .collect();

        let mut stats = PoolStats {
            total_servers: snapshot.len(),
            ..Default::default()
        };
        for (id, pool) in snapshot {
            let server = pool.stats();
            stats.total_connections += server.total;
            stats.available_connections += server.available;
            stats.active_connections += server.active;
            stats.servers.insert(id, server);
        }
        stats
    }

    /// Stops all background work, waits for it, then disconnects every connection.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        let pools: Vec<Arc<ServerPool>> = self.servers.write().drain().map(|(_, p)| p).collect();
        let mut closed = 0;
        for pool in pools {
            for conn in pool.drain() {
                conn.disconnect().await;
                closed += 1;
            }
        }
        info!(closed, "connection pool closed");
    }
}

async fn cleanup_servers(servers: &RwLock<HashMap<String, Arc<ServerPool>>>) -> usize {
    let snapshot: Vec<Arc<ServerPool>> = servers.read().values().cloned().collect();
    let mut removed = 0;
    for pool in snapshot {
        removed += pool.cleanup().await;
    }
    removed
}
