//! TCP accept loop driving the [`Router`](super::Router): per-connection
//! host-header sniffing followed by a bidirectional splice to the resolved
//! backend, or a canned close.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::central_store::ClusterDirectory;
use super::host::{RouteVerdict, HOST_HEADER_BUFFER_LIMIT};
use super::service::Router;

/// Bind `router.config().bind_addr` and accept connections forever, each
/// driven by [`serve_connection`]. A connection task that errors or panics
/// degrades to closing its socket -- nothing a
/// single client does may take down the listener.
pub async fn run_accept_loop<D>(router: std::sync::Arc<Router<D>>, bind_addr: &str) -> std::io::Result<()>
where
    D: ClusterDirectory + Send + Sync + 'static,
{
    let listener = TcpListener::bind(bind_addr).await?;
    tracing::info!(bind_addr, "director listening");

    loop {
        let (client, peer) = listener.accept().await?;
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(&router, client).await {
                tracing::debug!(%peer, error = %err, "connection ended");
            }
        });
    }
}

async fn serve_connection<D>(router: &Router<D>, mut client: TcpStream) -> std::io::Result<()>
where
    D: ClusterDirectory,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        let n = client.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        match router.route(&buf).await {
            RouteVerdict::NeedMoreData => {
                if buf.len() >= HOST_HEADER_BUFFER_LIMIT {
                    close_with(&mut client, 400, "request header too large").await?;
                    return Ok(());
                }
                continue;
            }
            RouteVerdict::Close { code, reason } => {
                close_with(&mut client, code, &reason).await?;
                return Ok(());
            }
            RouteVerdict::ForwardTo(backend) => {
                let mut upstream = match TcpStream::connect(&backend).await {
                    Ok(s) => s,
                    Err(err) => {
                        tracing::warn!(backend, error = %err, "backend connect failed");
                        tokio::time::sleep(router.retry_delay()).await;
                        close_with(&mut client, 502, "backend unavailable").await?;
                        return Ok(());
                    }
                };
                upstream.write_all(&buf).await?;
                buf.clear();
                tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
                return Ok(());
            }
        }
    }
}

async fn close_with(client: &mut TcpStream, code: u16, reason: &str) -> std::io::Result<()> {
    let body = format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n");
    client.write_all(body.as_bytes()).await?;
    client.shutdown().await
}
