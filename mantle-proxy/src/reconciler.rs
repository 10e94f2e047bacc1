//! Maintains the set of load balancers backing exposed services.
use crate::lb::{HealthConfig, LoadBalancer};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Debug, Default)]
pub struct ReconcilerConfig {
    pub health: HealthConfig,
    /// Create lazy balancers: health checking starts on first use and
    /// retires when idle.
    pub lazy: bool,
}

#[derive(Default)]
struct State {
    lbs: HashMap<(String, String), LoadBalancer>,
    /// Aliases are unique across clusters; last writer wins.
    aliases: HashMap<String, String>,
}

/// Keeps one load balancer per (cluster, alias) in sync with the desired
/// upstream map, plus the global alias index the HTTP handler resolves
/// against. The handler shares this mutex and releases it before dialing.
#[derive(Clone)]
pub struct Reconciler {
    state: Arc<Mutex<State>>,
    config: ReconcilerConfig,
}

impl Reconciler {
    #[must_use]
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            config,
        }
    }

    /// Brings one cluster's balancers in line with `upstreams`
    /// (alias → upstream addresses): absent aliases shut down, present ones
    /// are created or updated in place.
    pub fn reconcile(&self, cluster: &str, upstreams: &BTreeMap<String, Vec<String>>) {
        let mut state = self.state.lock();

        let stale: Vec<(String, String)> = state
            .lbs
            .keys()
            .filter(|(c, alias)| c == cluster && !upstreams.contains_key(alias))
            .cloned()
            .collect();
        for key in stale {
            if let Some(lb) = state.lbs.remove(&key) {
                lb.shutdown();
            }
            if state.aliases.get(&key.1).map(String::as_str) == Some(cluster) {
                state.aliases.remove(&key.1);
            }
            info!(cluster, alias = %key.1, "removed workload balancer");
        }

        for (alias, addrs) in upstreams {
            match state.lbs.get(&(cluster.to_string(), alias.clone())) {
                Some(lb) => lb.replace_upstreams(addrs.clone()),
                None => {
                    let lb = LoadBalancer::new(
                        cluster,
                        alias,
                        addrs.clone(),
                        self.config.lazy,
                        self.config.health.clone(),
                    );
                    if !self.config.lazy {
                        lb.start();
                    }
                    state.lbs.insert((cluster.to_string(), alias.clone()), lb);
                    info!(cluster, alias = %alias, "created workload balancer");
                }
            }
            // Last writer wins; the displaced cluster's balancer goes away
            // with its stale mapping.
            if let Some(previous) = state
                .aliases
                .insert(alias.clone(), cluster.to_string())
            {
                if previous != cluster {
                    if let Some(old) = state.lbs.remove(&(previous, alias.clone())) {
                        old.shutdown();
                    }
                }
            }
        }
    }

    /// Drops every balancer belonging to `cluster`.
    pub fn remove_cluster(&self, cluster: &str) {
        self.reconcile(cluster, &BTreeMap::new());
    }

    /// Resolves an alias to its balancer and owning cluster.
    #[must_use]
    pub fn lookup(&self, alias: &str) -> Option<(LoadBalancer, String)> {
        let state = self.state.lock();
        let cluster = state.aliases.get(alias)?.clone();
        let lb = state.lbs.get(&(cluster.clone(), alias.to_string()))?.clone();
        Some((lb, cluster))
    }

    /// Polls every balancer so lazy ones can retire after their idle window.
    pub fn notify(&self) {
        let state = self.state.lock();
        for lb in state.lbs.values() {
            lb.retire_if_idle();
        }
    }

    /// Shuts everything down.
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        for (_, lb) in state.lbs.drain() {
            lb.shutdown();
        }
        state.aliases.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstreams(pairs: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        pairs
            .iter()
            .map(|(alias, addrs)| {
                (
                    alias.to_string(),
                    addrs.iter().map(|a| a.to_string()).collect(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn reconcile_creates_updates_and_removes_balancers() {
        let reconciler = Reconciler::new(ReconcilerConfig {
            lazy: true,
            ..ReconcilerConfig::default()
        });

        reconciler.reconcile(
            "c1",
            &upstreams(&[("web", &["10.0.0.1:80"]), ("db", &["10.0.0.2:5432"])]),
        );
        assert!(reconciler.lookup("web").is_some());
        assert!(reconciler.lookup("db").is_some());

        // db disappears, web gets a new pool.
        reconciler.reconcile("c1", &upstreams(&[("web", &["10.0.0.9:80"])]));
        assert!(reconciler.lookup("db").is_none());
        let (lb, cluster) = reconciler.lookup("web").unwrap();
        assert_eq!(cluster, "c1");
        assert_eq!(lb.pick_address().unwrap(), "10.0.0.9:80");
    }

    #[tokio::test]
    async fn alias_moves_to_the_last_writing_cluster() {
        let reconciler = Reconciler::new(ReconcilerConfig {
            lazy: true,
            ..ReconcilerConfig::default()
        });
        reconciler.reconcile("c1", &upstreams(&[("web", &["10.0.0.1:80"])]));
        reconciler.reconcile("c2", &upstreams(&[("web", &["10.0.1.1:80"])]));

        let (lb, cluster) = reconciler.lookup("web").unwrap();
        assert_eq!(cluster, "c2");
        assert_eq!(lb.pick_address().unwrap(), "10.0.1.1:80");
    }

    #[tokio::test]
    async fn remove_cluster_drops_its_aliases() {
        let reconciler = Reconciler::new(ReconcilerConfig {
            lazy: true,
            ..ReconcilerConfig::default()
        });
        reconciler.reconcile("c1", &upstreams(&[("web", &["10.0.0.1:80"])]));
        reconciler.remove_cluster("c1");
        assert!(reconciler.lookup("web").is_none());
    }
}
