//! Environment-driven configuration, following the `main.rs`
//! convention of `env::var(...).expect(...)` for required settings and
//! `.unwrap_or_else` for defaulted ones rather than a config-file framework.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Hostnames ending in this suffix are routable; the bare suffix itself
    /// is the management API.
    pub service_domain: String,
    /// Port the backend web server listens on for collection traffic.
    pub web_server_port: u16,
    /// Whitespace-separated list of management API backend hosts.
    pub management_hosts: Vec<String>,
    /// Address the director's TCP accept loop binds.
    pub bind_addr: String,
    /// Postgres connection string for the central (router) database.
    pub database_url: String,
    /// Delay before returning a `500 Retry later` when a cluster has no
    /// available hosts.
    pub retry_delay: Duration,
    /// Capacity of the collection-name -> cluster-id LRU cache.
    pub collection_cache_capacity: usize,
    /// Optional TTL on negatively-cached (unknown) collections. `None`
    /// means "cache forever", matching the reference implementation's
    /// default rather than silently changing that behavior.
    pub negative_cache_ttl: Option<Duration>,
    /// Root directory under which value files are resolved.
    pub repository_root: std::path::PathBuf,
    /// Encoded-block unit size used for resumable-read offset arithmetic.
    pub encoded_block_slice_size: i64,
}

impl Config {
    pub fn from_env() -> Self {
        let service_domain =
            env::var("NIMBUSIO_SERVICE_DOMAIN").expect("NIMBUSIO_SERVICE_DOMAIN must be set");
        let web_server_port = env::var("NIMBUSIO_WEB_SERVER_PORT")
            .expect("NIMBUSIO_WEB_SERVER_PORT must be set")
            .parse()
            .expect("NIMBUSIO_WEB_SERVER_PORT must be a valid port number");
        let management_hosts = env::var("NIMBUSIO_MANAGEMENT_API_HOSTS")
            .expect("NIMBUSIO_MANAGEMENT_API_HOSTS must be set")
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:9000".to_owned());
        let database_url = env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let retry_delay_ms: u64 = env::var("RETRY_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let collection_cache_capacity: usize = env::var("COLLECTION_CACHE_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(500_000);
        let negative_cache_ttl = env::var("NEGATIVE_CACHE_TTL_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs);
        let repository_root = env::var("REPOSITORY_ROOT")
            .unwrap_or_else(|_| "/var/lib/nimbus/repository".to_owned())
            .into();
        let encoded_block_slice_size: i64 = env::var("ENCODED_BLOCK_SLICE_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(131_072);

        Self {
            service_domain,
            web_server_port,
            management_hosts,
            bind_addr,
            database_url,
            retry_delay: Duration::from_millis(retry_delay_ms),
            collection_cache_capacity,
            negative_cache_ttl,
            repository_root,
            encoded_block_slice_size,
        }
    }
}
