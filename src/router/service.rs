//! The `Router`: ties the host-header parser, the two caches and a
//! [`ClusterDirectory`] together into the routing policy below.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;

use crate::config::Config;
use crate::model::ClusterHosts;

use super::cache::{ClusterCache, CollectionCache};
use super::central_store::ClusterDirectory;
use super::host::{parse_host_header, RouteVerdict};

/// Round-robins over a fixed list by index, wrapping around. Kept as an
/// index into the owning `ClusterHosts`/host-list snapshot rather than a
/// rotated copy, so a cache refresh can swap the snapshot out without
/// losing rotation fairness across concurrent callers.
struct RoundRobin {
    next: usize,
}

impl RoundRobin {
    fn new() -> Self {
        Self { next: 0 }
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        if items.is_empty() {
            return None;
        }
        // Rotate before reading the head, matching `hosts.rotate(1); hosts[0]`
        // in the reference implementation: the very first pick must not land
        // on index 0.
        self.next = self.next.wrapping_add(1);
        let idx = self.next % items.len();
        Some(&items[idx])
    }
}

pub struct Router<D> {
    config: Config,
    directory: D,
    collection_cache: CollectionCache,
    cluster_cache: ClusterCache,
    cluster_rotation: Mutex<HashMap<i64, RoundRobin>>,
    management_rotation: Mutex<RoundRobin>,
    management_hosts: Vec<String>,
    ready_tx: watch::Sender<bool>,
    ready_rx: watch::Receiver<bool>,
}

impl<D: ClusterDirectory> Router<D> {
    pub fn new(config: Config, directory: D) -> Self {
        let (ready_tx, ready_rx) = watch::channel(false);
        let collection_cache = CollectionCache::new(
            config.collection_cache_capacity,
            config.negative_cache_ttl,
        );
        let management_hosts = config.management_hosts.clone();
        Self {
            config,
            directory,
            collection_cache,
            cluster_cache: ClusterCache::new(),
            cluster_rotation: Mutex::new(HashMap::new()),
            management_rotation: Mutex::new(RoundRobin::new()),
            management_hosts,
            ready_tx,
            ready_rx,
        }
    }

    /// Signal that the initial central-DB connection has completed. Until
    /// this fires, [`Router::route`] blocks rather than routing against an
    /// unconnected directory.
    pub fn mark_ready(&self) {
        let _ = self.ready_tx.send(true);
    }

    async fn wait_ready(&self) {
        let mut rx = self.ready_rx.clone();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }

    /// Decide what to do with a connection whose buffered bytes so far are
    /// `buf`. Routing policy:
    ///
    /// 1. Wait for initialization to complete.
    /// 2. Parse the `Host:` header; if absent and under the buffer limit,
    ///    ask for more data; if absent at the limit, close.
    /// 3. Strip the configured service-domain suffix. An exact match (empty
    ///    remainder) routes to the management API host pool.
    /// 4. Otherwise the remainder is a collection name: resolve it to a
    ///    cluster id (cached, negative-cacheable) and close if unknown.
    /// 5. Resolve the cluster id to a host list (cached) and round-robin
    ///    across it; an empty list closes with the configured retry delay
    ///    advertised to the caller.
    pub async fn route(&self, buf: &[u8]) -> RouteVerdict {
        self.wait_ready().await;

        let Some(host_header) = parse_host_header(buf) else {
            if buf.len() >= super::host::HOST_HEADER_BUFFER_LIMIT {
                return RouteVerdict::Close {
                    code: 400,
                    reason: "no Host header found".to_owned(),
                };
            }
            return RouteVerdict::NeedMoreData;
        };

        let Some(remainder) = host_header.strip_suffix(&self.config.service_domain) else {
            return RouteVerdict::Close {
                code: 404,
                reason: "unrecognized host".to_owned(),
            };
        };
        let remainder = remainder.trim_end_matches('.');

        if remainder.is_empty() {
            return self.route_to_management();
        }

        self.route_to_collection(remainder).await
    }

    fn route_to_management(&self) -> RouteVerdict {
        let mut rotation = self.management_rotation.lock().unwrap();
        let hosts: Vec<&String> = self.management_hosts.iter().collect();
        match rotation.pick(&hosts) {
            Some(host) => RouteVerdict::ForwardTo(format!("{host}:{}", self.config.web_server_port)),
            None => RouteVerdict::Close {
                code: 503,
                reason: "no management hosts configured".to_owned(),
            },
        }
    }

    async fn route_to_collection(&self, collection: &str) -> RouteVerdict {
        // Caching is delegated to the directory call itself: the cache
        // check-and-populate happens on the far side of the central DB's
        // connection mutex so concurrent misses on the same key collapse
        // onto one query instead of one per caller.
        let cluster_id = match self
            .directory
            .cluster_id_for_collection(collection, &self.collection_cache)
            .await
        {
            Ok(id) => id,
            Err(err) => {
                tracing::warn!(error = %err, collection, "collection lookup failed");
                return RouteVerdict::Close {
                    code: 500,
                    reason: "database unavailable".to_owned(),
                };
            }
        };

        let Some(cluster_id) = cluster_id else {
            return RouteVerdict::Close {
                code: 404,
                reason: "unknown collection".to_owned(),
            };
        };

        let hosts = match self
            .directory
            .hosts_for_cluster(cluster_id, &self.cluster_cache)
            .await
        {
            Ok(hosts) => hosts,
            Err(err) => {
                tracing::warn!(error = %err, cluster_id, "cluster host lookup failed");
                return RouteVerdict::Close {
                    code: 500,
                    reason: "database unavailable".to_owned(),
                };
            }
        };

        self.route_to_host(cluster_id, &hosts)
    }

    fn route_to_host(&self, cluster_id: i64, hosts: &ClusterHosts) -> RouteVerdict {
        let mut rotations = self.cluster_rotation.lock().unwrap();
        let rotation = rotations.entry(cluster_id).or_insert_with(RoundRobin::new);
        match rotation.pick(&hosts.hosts) {
            Some(host) => {
                RouteVerdict::ForwardTo(format!("{}:{}", host.hostname, self.config.web_server_port))
            }
            None => {
                tracing::warn!(cluster_id, "cluster has no available hosts");
                RouteVerdict::Close {
                    code: 503,
                    reason: format!("retry after {}ms", self.config.retry_delay.as_millis()),
                }
            }
        }
    }

    pub fn retry_delay(&self) -> Duration {
        self.config.retry_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RouterError;
    use crate::model::NodeHost;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeDirectory {
        clusters: HashMap<String, i64>,
        hosts: HashMap<i64, Vec<NodeHost>>,
        lookups: AtomicUsize,
    }

    impl ClusterDirectory for FakeDirectory {
        async fn cluster_id_for_collection(
            &self,
            collection: &str,
            cache: &CollectionCache,
        ) -> Result<Option<i64>, RouterError> {
            if let Some(hit) = cache.get(collection) {
                return Ok(hit);
            }
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let cluster_id = self.clusters.get(collection).copied();
            cache.put(collection.to_owned(), cluster_id);
            Ok(cluster_id)
        }

        async fn hosts_for_cluster(
            &self,
            cluster_id: i64,
            cache: &ClusterCache,
        ) -> Result<ClusterHosts, RouterError> {
            if let Some(hit) = cache.get(cluster_id) {
                return Ok(hit);
            }
            let hosts = ClusterHosts {
                cluster_id,
                hosts: self.hosts.get(&cluster_id).cloned().unwrap_or_default(),
            };
            cache.put(hosts.clone());
            Ok(hosts)
        }
    }

    fn config() -> Config {
        Config {
            service_domain: ".nimbus.example".to_owned(),
            web_server_port: 8080,
            management_hosts: vec!["mgmt-a".to_owned(), "mgmt-b".to_owned()],
            bind_addr: "0.0.0.0:9000".to_owned(),
            database_url: "postgres://unused".to_owned(),
            retry_delay: Duration::from_millis(500),
            collection_cache_capacity: 16,
            negative_cache_ttl: None,
            repository_root: "/tmp".into(),
            encoded_block_slice_size: 131_072,
        }
    }

    fn host_buf(host: &str) -> Vec<u8> {
        format!("GET / HTTP/1.1\r\nHost: {host}\r\n\r\n").into_bytes()
    }

    #[test]
    fn round_robin_rotates_before_returning_the_first_pick() {
        let mut rr = RoundRobin::new();
        let items = ["n1", "n2", "n3"];
        assert_eq!(rr.pick(&items), Some(&"n2"));
        assert_eq!(rr.pick(&items), Some(&"n3"));
        assert_eq!(rr.pick(&items), Some(&"n1"));
        assert_eq!(rr.pick(&items), Some(&"n2"));
    }

    // S1: a bare suffix match routes to a management host, rotating before
    // returning the head so the first call doesn't land on the first host.
    #[tokio::test]
    async fn s1_bare_suffix_routes_to_management() {
        let directory = FakeDirectory {
            clusters: HashMap::new(),
            hosts: HashMap::new(),
            lookups: AtomicUsize::new(0),
        };
        let router = Router::new(config(), directory);
        router.mark_ready();
        let first = router.route(&host_buf("nimbus.example")).await;
        assert_eq!(first, RouteVerdict::ForwardTo("mgmt-b:8080".to_owned()));
        let second = router.route(&host_buf("nimbus.example")).await;
        assert_eq!(second, RouteVerdict::ForwardTo("mgmt-a:8080".to_owned()));
    }

    // S2: a known collection resolves through cluster to a concrete host.
    #[tokio::test]
    async fn s2_known_collection_routes_to_cluster_host() {
        let mut clusters = HashMap::new();
        clusters.insert("col-a".to_owned(), 1);
        let mut hosts = HashMap::new();
        hosts.insert(
            1,
            vec![NodeHost {
                node_name: "node-0".to_owned(),
                hostname: "node-0.internal".to_owned(),
                node_number_in_cluster: 0,
            }],
        );
        let directory = FakeDirectory {
            clusters,
            hosts,
            lookups: AtomicUsize::new(0),
        };
        let router = Router::new(config(), directory);
        router.mark_ready();
        let verdict = router.route(&host_buf("col-a.nimbus.example")).await;
        assert_eq!(
            verdict,
            RouteVerdict::ForwardTo("node-0.internal:8080".to_owned())
        );
    }

    // S3: an unknown collection closes with a 404-shaped verdict.
    #[tokio::test]
    async fn s3_unknown_collection_closes() {
        let directory = FakeDirectory {
            clusters: HashMap::new(),
            hosts: HashMap::new(),
            lookups: AtomicUsize::new(0),
        };
        let router = Router::new(config(), directory);
        router.mark_ready();
        let verdict = router.route(&host_buf("ghost.nimbus.example")).await;
        assert!(matches!(verdict, RouteVerdict::Close { code: 404, .. }));
    }

    // Law 6: round robin distributes evenly across a cluster's hosts.
    #[tokio::test]
    async fn law6_round_robin_is_fair_across_hosts() {
        let mut clusters = HashMap::new();
        clusters.insert("col-a".to_owned(), 1);
        let mut hosts = HashMap::new();
        hosts.insert(
            1,
            (0..3)
                .map(|i| NodeHost {
                    node_name: format!("node-{i}"),
                    hostname: format!("node-{i}.internal"),
                    node_number_in_cluster: i,
                })
                .collect(),
        );
        let directory = FakeDirectory {
            clusters,
            hosts,
            lookups: AtomicUsize::new(0),
        };
        let router = Router::new(config(), directory);
        router.mark_ready();

        let mut counts = HashMap::new();
        for _ in 0..30 {
            if let RouteVerdict::ForwardTo(dest) = router.route(&host_buf("col-a.nimbus.example")).await {
                *counts.entry(dest).or_insert(0) += 1;
            }
        }
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 10));
    }

    // Law 5 (sequential): repeated misses for an already-warm key never
    // re-query once the first call has populated the cache.
    #[tokio::test]
    async fn law5_repeated_misses_collapse_onto_one_db_query() {
        let mut clusters = HashMap::new();
        clusters.insert("col-a".to_owned(), 1);
        let directory = FakeDirectory {
            clusters,
            hosts: HashMap::new(),
            lookups: AtomicUsize::new(0),
        };
        let router = Router::new(config(), directory);
        router.mark_ready();
        for _ in 0..5 {
            router.route(&host_buf("col-a.nimbus.example")).await;
        }
        assert_eq!(router.directory.lookups.load(Ordering::SeqCst), 1);
    }

    /// A directory with its own mutex-guarded, artificially slow lookup --
    /// contended the same way `CentralDb::run` is, so this exercises the
    /// double-checked-locking pattern under real concurrency rather than
    /// sequential calls against an uncontended fake.
    struct ContendedDirectory {
        clusters: HashMap<String, i64>,
        query_lock: tokio::sync::Mutex<()>,
        lookups: AtomicUsize,
    }

    impl ClusterDirectory for ContendedDirectory {
        async fn cluster_id_for_collection(
            &self,
            collection: &str,
            cache: &CollectionCache,
        ) -> Result<Option<i64>, RouterError> {
            if let Some(hit) = cache.get(collection) {
                return Ok(hit);
            }
            let _guard = self.query_lock.lock().await;
            if let Some(hit) = cache.get(collection) {
                return Ok(hit);
            }
            self.lookups.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let cluster_id = self.clusters.get(collection).copied();
            cache.put(collection.to_owned(), cluster_id);
            Ok(cluster_id)
        }

        async fn hosts_for_cluster(
            &self,
            cluster_id: i64,
            _cache: &ClusterCache,
        ) -> Result<ClusterHosts, RouterError> {
            Ok(ClusterHosts {
                cluster_id,
                hosts: vec![NodeHost {
                    node_name: "node-0".to_owned(),
                    hostname: "node-0.internal".to_owned(),
                    node_number_in_cluster: 0,
                }],
            })
        }
    }

    // Law 5 (concurrent): N tasks racing on the same cold collection
    // collapse onto exactly one database lookup.
    #[tokio::test]
    async fn law5_concurrent_misses_collapse_onto_one_db_query() {
        let mut clusters = HashMap::new();
        clusters.insert("col-a".to_owned(), 1);
        let directory = ContendedDirectory {
            clusters,
            query_lock: tokio::sync::Mutex::new(()),
            lookups: AtomicUsize::new(0),
        };
        let router = std::sync::Arc::new(Router::new(config(), directory));
        router.mark_ready();

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move { router.route(&host_buf("col-a.nimbus.example")).await })
            })
            .collect();
        for task in tasks {
            assert!(matches!(task.await.unwrap(), RouteVerdict::ForwardTo(_)));
        }
        assert_eq!(router.directory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_host_list_closes_with_retry_delay_reason() {
        let mut clusters = HashMap::new();
        clusters.insert("col-a".to_owned(), 1);
        let directory = FakeDirectory {
            clusters,
            hosts: HashMap::new(),
            lookups: AtomicUsize::new(0),
        };
        let router = Router::new(config(), directory);
        router.mark_ready();
        let verdict = router.route(&host_buf("col-a.nimbus.example")).await;
        assert!(matches!(verdict, RouteVerdict::Close { code: 503, .. }));
    }

    #[tokio::test]
    async fn route_waits_for_ready_before_querying() {
        let directory = FakeDirectory {
            clusters: HashMap::new(),
            hosts: HashMap::new(),
            lookups: AtomicUsize::new(0),
        };
        let router = std::sync::Arc::new(Router::new(config(), directory));
        let r2 = router.clone();
        let task = tokio::spawn(async move { r2.route(&host_buf("nimbus.example")).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());
        router.mark_ready();
        let verdict = task.await.unwrap();
        assert!(matches!(verdict, RouteVerdict::ForwardTo(_)));
    }
}
