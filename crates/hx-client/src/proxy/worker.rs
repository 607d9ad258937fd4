//! Bridges a work connection to the local service

use std::time::Duration;

use tokio::net::TcpStream;

use hx_core::BoxedStream;
use hx_protocol::StartWorkConnection;

/// Timeout for connecting to the local service
const LOCAL_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn serve_work_conn(
    proxy_name: String,
    local_addr: String,
    mut work_conn: BoxedStream,
    start: StartWorkConnection,
) {
    let local = tokio::time::timeout(LOCAL_DIAL_TIMEOUT, TcpStream::connect(&local_addr)).await;
    let mut local = match local {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::warn!(
                "Proxy [{}] failed to connect to local service {}: {}",
                proxy_name,
                local_addr,
                e
            );
            return;
        }
        Err(_) => {
            tracing::warn!(
                "Proxy [{}] timed out connecting to local service {}",
                proxy_name,
                local_addr
            );
            return;
        }
    };

    tracing::debug!(
        "Proxy [{}] bridging {}:{} to {}",
        proxy_name,
        start.src_addr,
        start.src_port,
        local_addr
    );

    match tokio::io::copy_bidirectional(&mut work_conn, &mut local).await {
        Ok((to_local, to_user)) => tracing::debug!(
            "Proxy [{}] work connection done: {} bytes in, {} bytes out",
            proxy_name,
            to_local,
            to_user
        ),
        Err(e) => tracing::debug!("Proxy [{}] work connection error: {}", proxy_name, e),
    }
}
