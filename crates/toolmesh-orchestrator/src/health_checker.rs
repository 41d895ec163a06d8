use crate::endpoint::{HealthScoring, ServerEndpoint};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use toolmesh_common::{ConnectionFactory, Result, ToolmeshError};
use tracing::{debug, info, warn};

/// Liveness probe for an endpoint.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, endpoint: &ServerEndpoint) -> Result<()>;
}

/// Probes an endpoint by opening a connection through the factory, pinging it
/// and closing it again.
pub struct FactoryProber {
    factory: Arc<dyn ConnectionFactory>,
}

impl FactoryProber {
    pub fn new(factory: Arc<dyn ConnectionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl EndpointProber for FactoryProber {
    async fn probe(&self, endpoint: &ServerEndpoint) -> Result<()> {
        let conn = self.factory.create_connection(endpoint.id()).await?;
        let pinged = conn.ping().await;
        if let Err(e) = conn.close().await {
            debug!(endpoint = %endpoint.id(), error = %e, "failed to close probe connection");
        }
        pinged
    }
}

/// Periodic health checks, one loop per endpoint.
///
/// Every `interval` each watched endpoint is probed with a `timeout`. The
/// outcome feeds the endpoint's health score through [`HealthScoring`].
/// A failed or timed-out probe only affects that endpoint's score; loops never
/// exit on probe errors.
pub struct EndpointHealthChecker {
    prober: Arc<dyn EndpointProber>,
    interval: Duration,
    timeout: Duration,
    scoring: HealthScoring,
    shutdown: Mutex<CancellationToken>,
    tracker: TaskTracker,
    loops: Mutex<HashMap<String, CancellationToken>>,
    running: AtomicBool,
}

impl EndpointHealthChecker {
    pub fn new(
        prober: Arc<dyn EndpointProber>,
        interval: Duration,
        timeout: Duration,
        scoring: HealthScoring,
    ) -> Self {
        Self {
            prober,
            interval,
            timeout,
            scoring,
            shutdown: Mutex::new(CancellationToken::new()),
            tracker: TaskTracker::new(),
            loops: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts a loop for each endpoint. Endpoints added later through
    /// [`watch`](Self::watch) get their loop immediately.
    ///
    /// A stopped checker can be started again.
    pub fn start(&self, endpoints: impl IntoIterator<Item = Arc<ServerEndpoint>>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut shutdown = self.shutdown.lock();
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }
        self.tracker.reopen();
        let mut started = 0;
        for endpoint in endpoints {
            self.spawn_loop(endpoint);
            started += 1;
        }
        info!(endpoints = started, interval_ms = self.interval.as_millis() as u64, "endpoint health checks started");
    }

    /// Begins checking `endpoint`, replacing any loop already running for its id.
    /// Does nothing until the checker is started.
    pub fn watch(&self, endpoint: Arc<ServerEndpoint>) {
        if self.is_running() {
            self.spawn_loop(endpoint);
        }
    }

    /// Stops the loop for `endpoint_id`, if any.
    pub fn unwatch(&self, endpoint_id: &str) {
        if let Some(token) = self.loops.lock().remove(endpoint_id) {
            token.cancel();
            debug!(endpoint = %endpoint_id, "stopped endpoint health checks");
        }
    }

    fn spawn_loop(&self, endpoint: Arc<ServerEndpoint>) {
        let token = self.shutdown.lock().child_token();
        if let Some(previous) = self.loops.lock().insert(endpoint.id().to_string(), token.clone()) {
            previous.cancel();
        }

        let prober = Arc::clone(&self.prober);
        let interval = self.interval;
        let timeout = self.timeout;
        let scoring = self.scoring;

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = token.cancelled() => break,
                            _ = probe_endpoint(prober.as_ref(), &endpoint, timeout, &scoring) => {}
                        }
                    }
                }
            }
        });
    }

    /// Probes `endpoint` once and applies the outcome. Returns whether the probe succeeded.
    pub async fn check_endpoint(&self, endpoint: &ServerEndpoint) -> bool {
        probe_endpoint(self.prober.as_ref(), endpoint, self.timeout, &self.scoring).await
    }

    /// Stops every loop and waits for them to exit.
    pub async fn stop(&self) {
        self.shutdown.lock().cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.loops.lock().clear();
        self.running.store(false, Ordering::SeqCst);
    }
}

async fn probe_endpoint(
    prober: &dyn EndpointProber,
    endpoint: &ServerEndpoint,
    timeout: Duration,
    scoring: &HealthScoring,
) -> bool {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(timeout, prober.probe(endpoint)).await {
        Ok(outcome) => outcome,
        Err(_) => Err(ToolmeshError::Probe(format!(
            "no response within {}ms",
            timeout.as_millis()
        ))),
    };
    let elapsed = started.elapsed();

    match outcome {
        Ok(()) => {
            if endpoint.record_success(elapsed, scoring) {
                info!(
                    endpoint = %endpoint.id(),
                    health_score = endpoint.health_score(),
                    "endpoint available again"
                );
            }
            true
        }
        Err(e) => {
            let flipped = endpoint.record_failure(elapsed, scoring);
            if flipped {
                warn!(
                    endpoint = %endpoint.id(),
                    health_score = endpoint.health_score(),
                    failures = endpoint.failure_count(),
                    error = %e,
                    "endpoint marked unavailable"
                );
            } else {
                debug!(endpoint = %endpoint.id(), error = %e, "endpoint health check failed");
            }
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use toolmesh_common::Connection;

    struct SwitchProber {
        healthy: AtomicBool,
        hang: AtomicBool,
        probes: AtomicU32,
    }

    impl SwitchProber {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                healthy: AtomicBool::new(true),
                hang: AtomicBool::new(false),
                probes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl EndpointProber for SwitchProber {
        async fn probe(&self, _endpoint: &ServerEndpoint) -> Result<()> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ToolmeshError::Probe("connection refused".into()))
            }
        }
    }

    fn checker(prober: Arc<SwitchProber>) -> EndpointHealthChecker {
        EndpointHealthChecker::new(
            prober,
            Duration::from_secs(30),
            Duration::from_secs(5),
            HealthScoring::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_endpoint_applies_outcome() {
        let prober = SwitchProber::new();
        let checker = checker(prober.clone());
        let endpoint = ServerEndpoint::new("a", "addr");

        prober.healthy.store(false, Ordering::SeqCst);
        assert!(!checker.check_endpoint(&endpoint).await);
        assert_eq!(endpoint.failure_count(), 1);
        assert!((endpoint.health_score() - 0.8).abs() < 1e-9);

        prober.healthy.store(true, Ordering::SeqCst);
        assert!(checker.check_endpoint(&endpoint).await);
        assert!((endpoint.health_score() - 0.82).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out_as_failure() {
        let prober = SwitchProber::new();
        prober.hang.store(true, Ordering::SeqCst);
        let checker = checker(prober);
        let endpoint = ServerEndpoint::new("a", "addr");

        assert!(!checker.check_endpoint(&endpoint).await);
        assert_eq!(endpoint.failure_count(), 1);
        assert_eq!(endpoint.response_time(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_probes_every_interval() {
        let prober = SwitchProber::new();
        let checker = checker(prober.clone());
        let endpoint = Arc::new(ServerEndpoint::new("a", "addr"));

        checker.start([Arc::clone(&endpoint)]);
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 3);

        checker.unwatch("a");
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 3);

        checker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_stop() {
        let prober = SwitchProber::new();
        let checker = checker(prober.clone());
        let endpoint = Arc::new(ServerEndpoint::new("a", "addr"));

        checker.start([Arc::clone(&endpoint)]);
        tokio::time::sleep(Duration::from_secs(35)).await;
        checker.stop().await;
        assert!(!checker.is_running());
        assert_eq!(prober.probes.load(Ordering::SeqCst), 1);

        checker.start([Arc::clone(&endpoint)]);
        assert!(checker.is_running());
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 3);

        checker.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_before_start_is_deferred() {
        let prober = SwitchProber::new();
        let checker = checker(prober.clone());

        checker.watch(Arc::new(ServerEndpoint::new("a", "addr")));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(prober.probes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_endpoint_flips_and_recovers() {
        let prober = SwitchProber::new();
        let checker = checker(prober.clone());
        let endpoint = Arc::new(ServerEndpoint::new("a", "addr"));
        checker.start([Arc::clone(&endpoint)]);

        prober.healthy.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30 * 11 + 1)).await;
        assert!(!endpoint.is_available());

        prober.healthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(endpoint.is_available());

        checker.stop().await;
        assert!(!checker.is_running());
    }

    struct PingConnection {
        ok: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Connection for PingConnection {
        async fn ping(&self) -> Result<()> {
            if self.ok {
                Ok(())
            } else {
                Err(ToolmeshError::Probe("ping failed".into()))
            }
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct PingFactory {
        ok: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ConnectionFactory for PingFactory {
        async fn create_connection(&self, _server_id: &str) -> Result<Arc<dyn Connection>> {
            Ok(Arc::new(PingConnection {
                ok: self.ok,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    #[tokio::test]
    async fn test_factory_prober_closes_probe_connection() {
        let closed = Arc::new(AtomicBool::new(false));
        let prober = FactoryProber::new(Arc::new(PingFactory {
            ok: false,
            closed: Arc::clone(&closed),
        }));

        let result = prober.probe(&ServerEndpoint::new("a", "addr")).await;
        assert!(matches!(result, Err(ToolmeshError::Probe(_))));
        assert!(closed.load(Ordering::SeqCst));
    }
}
