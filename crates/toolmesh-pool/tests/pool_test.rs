//! Connection pool integration tests
//!
//! Exercise the pool through its public surface with an in-memory factory:
//! - the per-server connection ceiling under concurrent checkout
//! - health-driven reconnection of pooled connections
//! - cancellation and shutdown behaviour

use async_trait::async_trait;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use toolmesh_common::{Connection, ConnectionFactory, Result, ToolmeshError};
use toolmesh_pool::{ConnectionPool, ConnectionPoolConfig, ConnectionState, StateChange};

struct MemoryConnection {
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl Connection for MemoryConnection {
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

#[derive(Default)]
struct MemoryFactory {
    healthy: Arc<AtomicBool>,
    stall: AtomicBool,
    creates: AtomicU32,
}

impl MemoryFactory {
    fn new() -> Arc<Self> {
        let factory = Self::default();
        factory.healthy.store(true, Ordering::SeqCst);
        Arc::new(factory)
    }
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    async fn create_connection(&self, _server_id: &str) -> Result<Arc<dyn Connection>> {
        if self.stall.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            healthy: Arc::clone(&self.healthy),
        }))
    }
}

async fn wait_for_state(events: &mut broadcast::Receiver<StateChange>, state: ConnectionState) -> Vec<StateChange> {
    let mut seen = Vec::new();
    loop {
        let change = events.recv().await.unwrap();
        seen.push(change);
        if change.to == state {
            return seen;
        }
    }
}

// ============================================================================
// Capacity
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_checkout_never_exceeds_max_connections() {
    let factory = MemoryFactory::new();
    let config = ConnectionPoolConfig::default().with_limits(1, 3);
    let pool = Arc::new(ConnectionPool::new(config, factory.clone()).unwrap());

    let outstanding = Arc::new(AtomicU32::new(0));
    let peak = Arc::new(AtomicU32::new(0));

    let workers = (0..12).map(|_| {
        let pool = Arc::clone(&pool);
        let outstanding = Arc::clone(&outstanding);
        let peak = Arc::clone(&peak);
        async move {
            let conn = pool.get_connection(&CancellationToken::new(), "search").await?;
            let now = outstanding.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);

            conn.use_handle()?;
            tokio::time::sleep(Duration::from_millis(50)).await;

            outstanding.fetch_sub(1, Ordering::SeqCst);
            pool.return_connection(conn).await;
            Ok::<_, ToolmeshError>(())
        }
    });

    for result in join_all(workers).await {
        assert!(result.is_ok());
    }

    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(factory.creates.load(Ordering::SeqCst) <= 3);
    let stats = pool.stats();
    assert!(stats.servers["search"].total <= 3);
    assert_eq!(stats.active_connections, 0);

    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_servers_are_pooled_independently() {
    let factory = MemoryFactory::new();
    let config = ConnectionPoolConfig::default()
        .with_limits(0, 1)
        .with_connection_timeout(Duration::from_secs(1));
    let pool = ConnectionPool::new(config, factory).unwrap();
    let cancel = CancellationToken::new();

    let _a = pool.get_connection(&cancel, "a").await.unwrap();
    let _b = pool.get_connection(&cancel, "b").await.unwrap();
    assert!(matches!(
        pool.get_connection(&cancel, "a").await,
        Err(ToolmeshError::ConnectionTimeout(_))
    ));

    let stats = pool.stats();
    assert_eq!(stats.total_servers, 2);
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
}

// ============================================================================
// Health monitoring and reconnection
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_unhealthy_connection_reconnects() {
    let factory = MemoryFactory::new();
    let config = ConnectionPoolConfig::default()
        .with_limits(0, 2)
        .with_health_check(Duration::from_secs(30), Duration::from_secs(5))
        .with_reconnect(Duration::from_secs(1), Duration::from_secs(30), 5);
    let pool = ConnectionPool::new(config, factory.clone()).unwrap();

    let conn = pool.get_connection(&CancellationToken::new(), "search").await.unwrap();
    let mut events = conn.subscribe();

    factory.healthy.store(false, Ordering::SeqCst);
    let failed = wait_for_state(&mut events, ConnectionState::Error).await;
    assert_eq!(failed.last().unwrap().from, ConnectionState::Connected);
    assert!(conn.last_error().unwrap().contains("connection reset"));

    factory.healthy.store(true, Ordering::SeqCst);
    let recovered = wait_for_state(&mut events, ConnectionState::Connected).await;
    let path: Vec<ConnectionState> = recovered.iter().map(|c| c.to).collect();
    assert_eq!(path, vec![ConnectionState::Reconnecting, ConnectionState::Connected]);

    assert_eq!(conn.state(), ConnectionState::Connected);
    assert!(conn.last_error().is_none());
    assert_eq!(factory.creates.load(Ordering::SeqCst), 2);
    assert!(conn.use_handle().is_ok());

    pool.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_in_error_is_not_reused() {
    let factory = MemoryFactory::new();
    let config = ConnectionPoolConfig::default()
        .with_limits(0, 2)
        .with_reconnect(Duration::from_secs(60), Duration::from_secs(60), 1);
    let pool = ConnectionPool::new(config, factory.clone()).unwrap();
    let cancel = CancellationToken::new();

    let conn = pool.get_connection(&cancel, "search").await.unwrap();
    let first_id = conn.id().to_string();
    let mut events = conn.subscribe();
    pool.return_connection(conn).await;

    factory.healthy.store(false, Ordering::SeqCst);
    wait_for_state(&mut events, ConnectionState::Error).await;
    factory.healthy.store(true, Ordering::SeqCst);

    let replacement = pool.get_connection(&cancel, "search").await.unwrap();
    assert_ne!(replacement.id(), first_id);
    assert_eq!(replacement.state(), ConnectionState::Connected);
}

// ============================================================================
// Cancellation and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancelled_creation_releases_capacity() {
    let factory = MemoryFactory::new();
    factory.stall.store(true, Ordering::SeqCst);
    let config = ConnectionPoolConfig::default().with_limits(0, 1);
    let pool = Arc::new(ConnectionPool::new(config, factory.clone()).unwrap());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = pool.get_connection(&cancel, "search").await.unwrap_err();
    assert!(matches!(err, ToolmeshError::Cancelled));

    factory.stall.store(false, Ordering::SeqCst);
    let conn = pool.get_connection(&CancellationToken::new(), "search").await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Connected);
    assert_eq!(pool.stats().servers["search"].total, 1);
}

#[tokio::test]
async fn test_close_disconnects_everything() {
    let factory = MemoryFactory::new();
    let pool = ConnectionPool::new(ConnectionPoolConfig::default().with_limits(0, 4), factory).unwrap();
    pool.start();
    let cancel = CancellationToken::new();

    let held = pool.get_connection(&cancel, "a").await.unwrap();
    let idle = pool.get_connection(&cancel, "b").await.unwrap();
    pool.return_connection(Arc::clone(&idle)).await;

    pool.close().await;

    assert_eq!(held.state(), ConnectionState::Closed);
    assert_eq!(idle.state(), ConnectionState::Closed);
    assert!(held.use_handle().is_err());
    assert!(matches!(
        pool.get_connection(&cancel, "a").await,
        Err(ToolmeshError::PoolClosed)
    ));
}
