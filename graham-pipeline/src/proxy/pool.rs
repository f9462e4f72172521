//! The relay registry.
//!
//! One mutex guards the endpoint list, so reservation, scoring and cooldown
//! release are serialized. Health checks run outside the lock and apply their
//! results afterwards.

use futures::future::join_all;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use graham_common::error::ResultExt;
use graham_common::util::redact_credentials;

use crate::config::ProxyConfig;
use crate::fetcher::{Fetcher, ProxyRoute};

use super::endpoint::{ProxyEndpoint, ProxyProtocol, ProxyState, ScorePolicy};
use super::ProxyPoolError;

/// Endpoints listed in [`PoolStats::top`].
const TOP_ENDPOINTS: usize = 10;

type Registry = Arc<Mutex<Vec<ProxyEndpoint>>>;

fn lock_registry(registry: &Mutex<Vec<ProxyEndpoint>>) -> MutexGuard<'_, Vec<ProxyEndpoint>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Lease
// ============================================================================

/// A reserved slot on one endpoint.
///
/// Hand it back with [`ProxyPool::report`]. A lease dropped without a report
/// frees its slot without touching the score.
#[derive(Debug)]
pub struct ProxyLease {
    route: ProxyRoute,
    registry: Weak<Mutex<Vec<ProxyEndpoint>>>,
    released: bool,
}

impl ProxyLease {
    pub fn route(&self) -> &ProxyRoute {
        &self.route
    }

    pub fn address(&self) -> &str {
        &self.route.address
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            let mut endpoints = lock_registry(&registry);
            if let Some(endpoint) = endpoints.iter_mut().find(|e| e.address == self.route.address) {
                endpoint.in_use = endpoint.in_use.saturating_sub(1);
            }
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Outcome of a health-check sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub checked: usize,
    pub healthy: usize,
}

/// Loggable view of one endpoint; credentials are redacted.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub address: String,
    pub protocol: ProxyProtocol,
    pub state: ProxyState,
    pub score: u32,
    pub success_rate: f64,
    pub avg_latency_ms: Option<f64>,
}

impl From<&ProxyEndpoint> for EndpointSnapshot {
    fn from(endpoint: &ProxyEndpoint) -> Self {
        Self {
            address: redact_credentials(&endpoint.address),
            protocol: endpoint.protocol,
            state: endpoint.state,
            score: endpoint.score,
            success_rate: endpoint.success_rate(),
            avg_latency_ms: endpoint.avg_latency_ms,
        }
    }
}

/// Pool-wide counts plus the best endpoints by score.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub untested: usize,
    pub active: usize,
    pub degraded: usize,
    pub banned: usize,
    pub in_use: usize,
    pub top: Vec<EndpointSnapshot>,
}

// ============================================================================
// Proxy Pool
// ============================================================================

/// Scored relay registry shared by all workers.
pub struct ProxyPool {
    registry: Registry,
    policy: ScorePolicy,
    cooldown: Duration,
    max_concurrent: usize,
}

impl ProxyPool {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Vec::new())),
            policy: ScorePolicy::from(config),
            cooldown: config.cooldown(),
            max_concurrent: config.max_concurrent_per_proxy.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ProxyEndpoint>> {
        lock_registry(&self.registry)
    }

    // ------------------------------------------------------------------------
    // Registry management
    // ------------------------------------------------------------------------

    /// Register an endpoint as untested. Returns `false` if the address is
    /// already registered.
    pub fn add(&self, raw: &str) -> Result<bool, ProxyPoolError> {
        let endpoint = ProxyEndpoint::parse(raw, self.policy.initial_score)?;
        let mut endpoints = self.lock();
        if endpoints.iter().any(|e| e.address == endpoint.address) {
            debug!(proxy = %redact_credentials(&endpoint.address), "Proxy already registered");
            return Ok(false);
        }
        info!(
            proxy = %redact_credentials(&endpoint.address),
            protocol = %endpoint.protocol,
            "Proxy added"
        );
        endpoints.push(endpoint);
        Ok(true)
    }

    /// Register several endpoints, skipping invalid ones. Returns how many
    /// were added.
    pub fn add_many<I, S>(&self, raws: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        raws.into_iter()
            .filter(|raw| match self.add(raw.as_ref()) {
                Ok(added) => added,
                Err(e) => {
                    warn!(error = %e, "Skipping proxy");
                    false
                }
            })
            .count()
    }

    /// Register one endpoint per line of `path`; blank lines and `#`
    /// comments are ignored.
    pub fn add_from_file(&self, path: &Path) -> graham_common::Result<usize> {
        let content = std::fs::read_to_string(path).context(format!("reading {}", path.display()))?;
        let added = self.add_many(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#')),
        );
        info!(path = %path.display(), added, "Loaded proxy list");
        Ok(added)
    }

    pub fn remove(&self, address: &str) -> bool {
        let mut endpoints = self.lock();
        let before = endpoints.len();
        endpoints.retain(|e| e.address != address);
        let removed = endpoints.len() != before;
        if removed {
            info!(proxy = %redact_credentials(address), "Proxy removed");
        }
        removed
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of one endpoint's current record.
    pub fn endpoint(&self, address: &str) -> Option<ProxyEndpoint> {
        self.lock().iter().find(|e| e.address == address).cloned()
    }

    // ------------------------------------------------------------------------
    // Selection & scoring
    // ------------------------------------------------------------------------

    /// Reserve the highest-scoring active endpoint below its concurrency cap.
    /// Ties go to the endpoint with fewer leases.
    pub fn get(&self) -> Result<ProxyLease, ProxyPoolError> {
        let mut endpoints = self.lock();
        self.release_cooled(&mut endpoints);

        let best = endpoints
            .iter_mut()
            .filter(|e| e.state == ProxyState::Active && e.in_use < self.max_concurrent)
            .max_by(|a, b| {
                a.score
                    .cmp(&b.score)
                    .then_with(|| b.in_use.cmp(&a.in_use))
                    .then_with(|| b.address.cmp(&a.address))
            })
            .ok_or(ProxyPoolError::NoProxyAvailable)?;

        best.in_use += 1;
        Ok(ProxyLease {
            route: ProxyRoute {
                address: best.address.clone(),
                url: best.url(),
            },
            registry: Arc::downgrade(&self.registry),
            released: false,
        })
    }

    /// Return a lease with the result of its use. Yields the endpoint's state
    /// afterwards, or `None` if it was removed while leased.
    pub fn report(&self, mut lease: ProxyLease, success: bool, latency: Duration) -> Option<ProxyState> {
        lease.released = true;
        let mut endpoints = self.lock();
        let endpoint = endpoints.iter_mut().find(|e| e.address == lease.route.address)?;
        endpoint.in_use = endpoint.in_use.saturating_sub(1);
        self.record(endpoint, success, latency);
        Some(endpoint.state)
    }

    fn record(&self, endpoint: &mut ProxyEndpoint, success: bool, latency: Duration) {
        let previous = endpoint.record(success, latency, &self.policy);
        if previous == endpoint.state {
            return;
        }

        let proxy = redact_credentials(&endpoint.address);
        match endpoint.state {
            ProxyState::Banned => warn!(
                proxy = %proxy,
                score = endpoint.score,
                cooldown_secs = self.cooldown.as_secs(),
                "Proxy banned"
            ),
            ProxyState::Degraded => warn!(
                proxy = %proxy,
                failures = endpoint.consecutive_failures,
                "Proxy degraded"
            ),
            state => info!(proxy = %proxy, from = %previous, to = %state, "Proxy state changed"),
        }
    }

    fn release_cooled(&self, endpoints: &mut [ProxyEndpoint]) {
        for endpoint in endpoints.iter_mut() {
            if endpoint.release_if_cooled(self.cooldown, &self.policy) {
                info!(
                    proxy = %redact_credentials(&endpoint.address),
                    "Proxy cooldown elapsed, awaiting re-verification"
                );
            }
        }
    }

    // ------------------------------------------------------------------------
    // Health sweeps
    // ------------------------------------------------------------------------

    /// Check every endpoint that is not serving a ban against `canary_url`.
    pub async fn test_all(&self, fetcher: &dyn Fetcher, canary_url: &str, timeout: Duration) -> SweepSummary {
        self.sweep(fetcher, canary_url, timeout, |_| true).await
    }

    /// Check endpoints that cannot be leased but are not serving a ban:
    /// untested ones (new, or back from cooldown) and degraded ones.
    pub async fn verify_inactive(
        &self,
        fetcher: &dyn Fetcher,
        canary_url: &str,
        timeout: Duration,
    ) -> SweepSummary {
        self.sweep(fetcher, canary_url, timeout, |state| {
            matches!(state, ProxyState::Untested | ProxyState::Degraded)
        })
        .await
    }

    async fn sweep<F>(&self, fetcher: &dyn Fetcher, canary_url: &str, timeout: Duration, select: F) -> SweepSummary
    where
        F: Fn(ProxyState) -> bool,
    {
        let targets: Vec<ProxyRoute> = {
            let mut endpoints = self.lock();
            self.release_cooled(&mut endpoints);
            endpoints
                .iter()
                .filter(|e| e.state != ProxyState::Banned && select(e.state))
                .map(|e| ProxyRoute {
                    address: e.address.clone(),
                    url: e.url(),
                })
                .collect()
        };

        if targets.is_empty() {
            return SweepSummary::default();
        }

        let checks = targets.into_iter().map(|route| async move {
            let start = Instant::now();
            let healthy = match tokio::time::timeout(timeout, fetcher.fetch(canary_url, Some(&route), timeout)).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!(proxy = %route.display_address(), error = %e, "Health check failed");
                    false
                }
                Err(_) => {
                    debug!(proxy = %route.display_address(), "Health check timed out");
                    false
                }
            };
            (route, healthy, start.elapsed())
        });
        let results = join_all(checks).await;

        let mut summary = SweepSummary::default();
        let mut endpoints = self.lock();
        for (route, healthy, latency) in results {
            summary.checked += 1;
            if healthy {
                summary.healthy += 1;
            }
            if let Some(endpoint) = endpoints.iter_mut().find(|e| e.address == route.address) {
                self.record(endpoint, healthy, latency);
            }
        }

        info!(
            checked = summary.checked,
            healthy = summary.healthy,
            "Proxy sweep complete"
        );
        summary
    }

    // ------------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> PoolStats {
        let endpoints = self.lock();
        let mut stats = PoolStats {
            total: endpoints.len(),
            ..Default::default()
        };

        for endpoint in endpoints.iter() {
            stats.in_use += endpoint.in_use;
            match endpoint.state {
                ProxyState::Untested => stats.untested += 1,
                ProxyState::Active => stats.active += 1,
                ProxyState::Degraded => stats.degraded += 1,
                ProxyState::Banned => stats.banned += 1,
            }
        }

        let mut ranked: Vec<&ProxyEndpoint> = endpoints.iter().collect();
        ranked.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.address.cmp(&b.address)));
        stats.top = ranked
            .into_iter()
            .take(TOP_ENDPOINTS)
            .map(EndpointSnapshot::from)
            .collect();
        stats
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::FetchError;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const CANARY: &str = "http://canary.local/";

    /// Canary fetches succeed only through the listed relays.
    struct CanaryFetcher {
        healthy: HashSet<String>,
        calls: AtomicUsize,
    }

    impl CanaryFetcher {
        fn new(healthy: &[&str]) -> Self {
            Self {
                healthy: healthy.iter().map(|s| s.to_string()).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Fetcher for CanaryFetcher {
        fn name(&self) -> &str {
            "canary"
        }

        async fn fetch(&self, _url: &str, proxy: Option<&ProxyRoute>, _timeout: Duration) -> Result<String, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match proxy {
                Some(route) if self.healthy.contains(&route.address) => Ok("ok".into()),
                _ => Err(FetchError::ConnectionError("refused".into())),
            }
        }
    }

    fn pool_with(config: ProxyConfig) -> ProxyPool {
        ProxyPool::new(&config)
    }

    fn pool() -> ProxyPool {
        pool_with(ProxyConfig::default())
    }

    async fn activate(pool: &ProxyPool, addresses: &[&str]) {
        pool.add_many(addresses.iter().copied());
        let fetcher = CanaryFetcher::new(addresses);
        pool.test_all(&fetcher, CANARY, Duration::from_secs(1)).await;
    }

    #[test]
    fn test_add_ignores_duplicates() {
        let pool = pool();
        assert!(pool.add("10.0.0.1:8080").unwrap());
        assert!(!pool.add("10.0.0.1:8080").unwrap());
        assert!(pool.add("socks5://10.0.0.2:1080").unwrap());
        assert_eq!(pool.len(), 2);

        let endpoint = pool.endpoint("10.0.0.1:8080").unwrap();
        assert_eq!(endpoint.state, ProxyState::Untested);
        assert_eq!(endpoint.score, 50);
    }

    #[test]
    fn test_add_many_skips_invalid() {
        let pool = pool();
        let added = pool.add_many(["10.0.0.1:8080", "not-a-proxy", "ftp://10.0.0.3:21", "10.0.0.4:3128"]);
        assert_eq!(added, 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let pool = pool();
        pool.add_many(["10.0.0.1:8080", "10.0.0.2:8080"]);
        assert!(pool.remove("10.0.0.1:8080"));
        assert!(!pool.remove("10.0.0.1:8080"));
        assert_eq!(pool.len(), 1);
        pool.clear();
        assert!(pool.is_empty());
    }

    #[test]
    fn test_add_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# office relays").unwrap();
        writeln!(file, "10.0.0.1:8080").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  socks5://10.0.0.2:1080  ").unwrap();

        let pool = pool();
        assert_eq!(pool.add_from_file(file.path()).unwrap(), 2);
        assert!(pool.add_from_file(Path::new("/nonexistent/proxies.txt")).is_err());
    }

    #[test]
    fn test_get_requires_verified_endpoint() {
        let pool = pool();
        pool.add("10.0.0.1:8080").unwrap();
        assert_eq!(pool.get().unwrap_err(), ProxyPoolError::NoProxyAvailable);
    }

    #[tokio::test]
    async fn test_test_all_promotes_and_penalizes() {
        let pool = pool();
        pool.add_many(["10.0.0.1:8080", "10.0.0.2:8080"]);
        let fetcher = CanaryFetcher::new(&["10.0.0.1:8080"]);

        let summary = pool.test_all(&fetcher, CANARY, Duration::from_secs(1)).await;
        assert_eq!(summary, SweepSummary { checked: 2, healthy: 1 });

        let good = pool.endpoint("10.0.0.1:8080").unwrap();
        assert_eq!(good.state, ProxyState::Active);
        assert_eq!(good.score, 60);

        let bad = pool.endpoint("10.0.0.2:8080").unwrap();
        assert_eq!(bad.state, ProxyState::Untested);
        assert_eq!(bad.score, 45);
    }

    #[tokio::test]
    async fn test_get_prefers_highest_score() {
        let pool = pool();
        activate(&pool, &["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let lease = pool.get().unwrap();
        pool.report(lease, true, Duration::from_millis(50));

        // Whichever won the tie now leads with 70
        let leader = pool.get().unwrap();
        assert_eq!(pool.endpoint(leader.address()).unwrap().score, 70);
    }

    #[tokio::test]
    async fn test_three_failures_degrade() {
        let pool = pool();
        activate(&pool, &["10.0.0.1:8080"]).await;

        for _ in 0..2 {
            let lease = pool.get().unwrap();
            pool.report(lease, false, Duration::ZERO);
            assert_eq!(pool.endpoint("10.0.0.1:8080").unwrap().state, ProxyState::Active);
        }
        let lease = pool.get().unwrap();
        pool.report(lease, false, Duration::ZERO);

        let endpoint = pool.endpoint("10.0.0.1:8080").unwrap();
        assert_eq!(endpoint.consecutive_failures, 3);
        assert_eq!(endpoint.state, ProxyState::Degraded);
        assert!(pool.get().is_err());
    }

    #[tokio::test]
    async fn test_get_never_returns_banned() {
        let pool = pool_with(ProxyConfig {
            initial_score: 25,
            max_concurrent_per_proxy: 1,
            ..Default::default()
        });
        activate(&pool, &["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        // Both at 35: failures take the victim to 30, 20, then 5 (banned)
        let victim = "10.0.0.1:8080";
        while pool.endpoint(victim).unwrap().state != ProxyState::Banned {
            let first = pool.get().unwrap();
            if first.address() == victim {
                pool.report(first, false, Duration::ZERO);
                continue;
            }
            let second = pool.get().unwrap();
            assert_eq!(second.address(), victim);
            pool.report(second, false, Duration::ZERO);
            drop(first);
        }
        assert_eq!(pool.endpoint(victim).unwrap().score, 5);

        for _ in 0..20 {
            let lease = pool.get().unwrap();
            assert_ne!(lease.address(), victim);
            pool.report(lease, true, Duration::ZERO);
        }
    }

    #[tokio::test]
    async fn test_banned_endpoint_returns_untested_after_cooldown() {
        let pool = pool_with(ProxyConfig {
            cooldown_seconds: 0,
            initial_score: 20,
            ..Default::default()
        });
        pool.add("10.0.0.1:8080").unwrap();

        let failing = CanaryFetcher::new(&[]);
        pool.test_all(&failing, CANARY, Duration::from_secs(1)).await;
        assert_eq!(pool.endpoint("10.0.0.1:8080").unwrap().state, ProxyState::Banned);

        let healthy = CanaryFetcher::new(&["10.0.0.1:8080"]);
        let summary = pool.verify_inactive(&healthy, CANARY, Duration::from_secs(1)).await;
        assert_eq!(summary.healthy, 1);

        let endpoint = pool.endpoint("10.0.0.1:8080").unwrap();
        assert_eq!(endpoint.state, ProxyState::Active);
        assert_eq!(endpoint.score, 30);
    }

    #[tokio::test]
    async fn test_verify_inactive_recovers_degraded_and_skips_active() {
        let pool = pool_with(ProxyConfig {
            max_concurrent_per_proxy: 1,
            ..Default::default()
        });
        activate(&pool, &["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let victim = "10.0.0.1:8080";
        while pool.endpoint(victim).unwrap().state != ProxyState::Degraded {
            let first = pool.get().unwrap();
            if first.address() == victim {
                pool.report(first, false, Duration::ZERO);
                continue;
            }
            let second = pool.get().unwrap();
            pool.report(second, false, Duration::ZERO);
            drop(first);
        }
        assert_eq!(pool.endpoint("10.0.0.1:8080").unwrap().state, ProxyState::Degraded);

        let healthy = CanaryFetcher::new(&["10.0.0.1:8080", "10.0.0.2:8080"]);
        let summary = pool.verify_inactive(&healthy, CANARY, Duration::from_secs(1)).await;

        assert_eq!(summary.checked, 1);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.endpoint("10.0.0.1:8080").unwrap().state, ProxyState::Active);
    }

    #[tokio::test]
    async fn test_banned_endpoint_skipped_during_cooldown() {
        let pool = pool_with(ProxyConfig {
            initial_score: 20,
            ..Default::default()
        });
        pool.add("10.0.0.1:8080").unwrap();
        let failing = CanaryFetcher::new(&[]);
        pool.test_all(&failing, CANARY, Duration::from_secs(1)).await;

        let healthy = CanaryFetcher::new(&["10.0.0.1:8080"]);
        let summary = pool.test_all(&healthy, CANARY, Duration::from_secs(1)).await;
        assert_eq!(summary.checked, 0);
        assert_eq!(healthy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_lease_drop() {
        let pool = pool_with(ProxyConfig {
            max_concurrent_per_proxy: 1,
            ..Default::default()
        });
        activate(&pool, &["10.0.0.1:8080"]).await;

        let lease = pool.get().unwrap();
        assert!(pool.get().is_err());
        drop(lease);

        let lease = pool.get().unwrap();
        let score = pool.endpoint("10.0.0.1:8080").unwrap().score;
        drop(lease);
        assert_eq!(pool.endpoint("10.0.0.1:8080").unwrap().score, score);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_get_never_over_claims() {
        let pool = Arc::new(pool_with(ProxyConfig {
            max_concurrent_per_proxy: 2,
            ..Default::default()
        }));
        activate(&pool, &["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let mut handles = Vec::new();
        for _ in 0..16 {
            let pool = Arc::clone(&pool);
            handles.push(tokio::spawn(async move { pool.get().ok() }));
        }

        let mut leases = Vec::new();
        for handle in handles {
            if let Some(lease) = handle.await.unwrap() {
                leases.push(lease);
            }
        }

        assert_eq!(leases.len(), 4);
        assert_eq!(pool.stats().in_use, 4);
    }

    #[tokio::test]
    async fn test_stats() {
        let pool = pool();
        pool.add("user:pw@10.0.0.9:8080").unwrap();
        activate(&pool, &["10.0.0.1:8080", "10.0.0.2:8080"]).await;

        let stats = pool.stats();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.active, 2);
        assert_eq!(stats.untested, 1);
        assert_eq!(stats.top.len(), 3);
        assert_eq!(stats.top[0].score, 60);
        assert!(stats.top.iter().any(|e| e.address == "***@10.0.0.9:8080"));
    }
}
