//! Director / Router: HTTP `Host:` header sniffing,
//! DB-backed collection -> cluster -> host resolution with stampede-safe
//! caching, and the TCP accept loop that drives it.

mod cache;
mod central_store;
mod host;
mod proxy;
mod service;

pub use cache::{ClusterCache, CollectionCache};
pub use central_store::{CentralDb, ClusterDirectory};
pub use host::{parse_host_header, RouteVerdict, HOST_HEADER_BUFFER_LIMIT};
pub use proxy::run_accept_loop;
pub use service::Router;
