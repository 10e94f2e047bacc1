//! Per-(cluster, alias) load balancers with tiered health checks.
use crate::dialer::dial;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Latency tier boundaries for TCP connect times; anything slower lands in
/// the final tier, unreachable upstreams in none.
const TIER_BOUNDS: [Duration; 3] = [
    Duration::from_millis(10),
    Duration::from_millis(50),
    Duration::from_millis(250),
];

#[derive(Clone, Debug)]
pub struct HealthConfig {
    pub dial_timeout: Duration,
    pub interval: Duration,
    /// Lazy balancers retire their health checker after this much unuse.
    pub idle_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

struct Inner {
    cluster: String,
    alias: String,
    lazy: bool,
    config: HealthConfig,
    upstreams: Mutex<Arc<Vec<String>>>,
    tiers: Mutex<HashMap<String, usize>>,
    last_used: Mutex<Instant>,
    health: Mutex<Option<CancellationToken>>,
}

/// Picks addresses from the best latency tier of a health-checked upstream
/// pool. Cloning shares the balancer.
#[derive(Clone)]
pub struct LoadBalancer {
    inner: Arc<Inner>,
}

impl LoadBalancer {
    pub(crate) fn new(
        cluster: &str,
        alias: &str,
        upstreams: Vec<String>,
        lazy: bool,
        config: HealthConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster: cluster.to_string(),
                alias: alias.to_string(),
                lazy,
                config,
                upstreams: Mutex::new(Arc::new(upstreams)),
                tiers: Mutex::new(HashMap::new()),
                last_used: Mutex::new(Instant::now()),
                health: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn cluster(&self) -> &str {
        &self.inner.cluster
    }

    #[must_use]
    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    /// Replaces the upstream set in one swap; the next pick observes the new
    /// pool, stale tier entries are pruned.
    pub fn replace_upstreams(&self, upstreams: Vec<String>) {
        let next = Arc::new(upstreams);
        *self.inner.upstreams.lock() = Arc::clone(&next);
        self.inner
            .tiers
            .lock()
            .retain(|addr, _| next.contains(addr));
    }

    /// Starts the periodic health checker; a no-op when already running.
    pub fn start(&self) {
        let mut health = self.inner.health.lock();
        if health.is_some() {
            return;
        }
        let ct = CancellationToken::new();
        *health = Some(ct.clone());
        drop(health);
        let lb = self.clone();
        tokio::spawn(async move {
            loop {
                lb.refresh().await;
                tokio::select! {
                    () = ct.cancelled() => break,
                    () = tokio::time::sleep(lb.inner.config.interval) => {}
                }
            }
        });
    }

    /// Stops the health checker; a lazy balancer restarts it on the next
    /// pick.
    pub fn shutdown(&self) {
        if let Some(ct) = self.inner.health.lock().take() {
            ct.cancel();
        }
    }

    /// One health pass: classify every upstream by TCP connect latency.
    pub async fn refresh(&self) {
        let upstreams = Arc::clone(&*self.inner.upstreams.lock());
        let timeout = self.inner.config.dial_timeout;
        let mut tiers = HashMap::with_capacity(upstreams.len());
        for addr in upstreams.iter() {
            let begin = Instant::now();
            match dial(addr, timeout).await {
                Ok(_) => {
                    let elapsed = begin.elapsed();
                    let tier = TIER_BOUNDS
                        .iter()
                        .position(|bound| elapsed < *bound)
                        .unwrap_or(TIER_BOUNDS.len());
                    tiers.insert(addr.clone(), tier);
                }
                Err(err) => {
                    debug!(upstream = %addr, error = %err, "health check failed");
                }
            }
        }
        *self.inner.tiers.lock() = tiers;
    }

    /// A random upstream from the best non-empty latency tier; falls back to
    /// the whole pool while no health data exists yet. Marks the balancer
    /// used and, for lazy balancers, starts health checking on first call.
    #[must_use]
    pub fn pick_address(&self) -> Option<String> {
        *self.inner.last_used.lock() = Instant::now();
        if self.inner.lazy {
            self.start();
        }
        let upstreams = Arc::clone(&*self.inner.upstreams.lock());
        if upstreams.is_empty() {
            return None;
        }
        let tiers = self.inner.tiers.lock();
        let best = upstreams
            .iter()
            .filter_map(|addr| tiers.get(addr))
            .min()
            .copied();
        let pool: Vec<&String> = match best {
            Some(best) => upstreams
                .iter()
                .filter(|addr| tiers.get(*addr) == Some(&best))
                .collect(),
            // No classification yet: stay optimistic until the first pass.
            None => upstreams.iter().collect(),
        };
        let choice = rand::rng().random_range(0..pool.len());
        Some(pool[choice].clone())
    }

    /// Stops a lazy balancer's health checker once it has sat unused past
    /// its idle window.
    pub fn retire_if_idle(&self) {
        if !self.inner.lazy {
            return;
        }
        let idle = self.inner.last_used.lock().elapsed() > self.inner.config.idle_timeout;
        if idle {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn accepting_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        (listener, addr)
    }

    #[tokio::test]
    async fn picks_only_reachable_upstreams_after_refresh() {
        let (listener, healthy) = accepting_listener().await;
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });
        // Reserved port that nothing listens on.
        let dead = "127.0.0.1:9".to_string();

        let lb = LoadBalancer::new(
            "c1",
            "web",
            vec![healthy.clone(), dead],
            false,
            HealthConfig {
                dial_timeout: Duration::from_millis(200),
                ..HealthConfig::default()
            },
        );
        lb.refresh().await;
        for _ in 0..10 {
            assert_eq!(lb.pick_address().unwrap(), healthy);
        }
    }

    #[tokio::test]
    async fn replace_upstreams_is_visible_to_the_next_pick() {
        let lb = LoadBalancer::new(
            "c1",
            "web",
            vec!["10.0.0.1:80".into()],
            false,
            HealthConfig::default(),
        );
        assert_eq!(lb.pick_address().unwrap(), "10.0.0.1:80");
        lb.replace_upstreams(vec!["10.0.0.2:80".into()]);
        assert_eq!(lb.pick_address().unwrap(), "10.0.0.2:80");
        lb.replace_upstreams(Vec::new());
        assert!(lb.pick_address().is_none());
    }

    #[tokio::test]
    async fn lazy_balancer_defers_health_checking_until_first_pick() {
        let lb = LoadBalancer::new(
            "c1",
            "web",
            vec!["10.0.0.1:80".into()],
            true,
            HealthConfig::default(),
        );
        assert!(lb.inner.health.lock().is_none());
        let _ = lb.pick_address();
        assert!(lb.inner.health.lock().is_some());
        lb.shutdown();
        assert!(lb.inner.health.lock().is_none());
    }
}
