use std::env;
use std::sync::Arc;

use nimbus_gateway::router::{run_accept_loop, CentralDb, Router};
use nimbus_gateway::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();

    info!("connecting to central database...");
    let directory = CentralDb::new(config.database_url.clone());
    directory.connect().await;
    info!("central database connection established");

    let router = Arc::new(Router::new(config, directory));
    router.mark_ready();

    if let Err(err) = run_accept_loop(router, &bind_addr).await {
        tracing::error!(error = %err, "accept loop exited");
    }
}
