//! Public TCP proxy

use std::sync::Weak;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use hx_core::config::ServerConfig;
use hx_protocol::{ProxyType, TcpProxyOptions};

use super::{handle_user_connection, ServerProxy, WorkConnProvider};
use crate::error::ServerError;

/// Bind the public port and start accepting user connections
pub async fn start_tcp_proxy(
    provider: Weak<dyn WorkConnProvider>,
    name: &str,
    options: &TcpProxyOptions,
    config: &ServerConfig,
) -> Result<ServerProxy, ServerError> {
    if !config.is_port_allowed(options.remote_port) {
        return Err(ServerError::InvalidProxy {
            name: name.to_string(),
            reason: format!("port {} is not allowed", options.remote_port),
        });
    }

    let bind_addr = format!("{}:{}", config.proxy_bind_addr, options.remote_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| ServerError::InvalidProxy {
            name: name.to_string(),
            reason: format!("failed to listen on {}: {}", bind_addr, e),
        })?;
    let local_addr = listener.local_addr()?;
    tracing::info!("Proxy [{}] listening on {}", name, local_addr);

    let cancel = CancellationToken::new();
    let task = tokio::spawn(accept_loop(listener, provider, name.to_string(), cancel.clone()));

    Ok(ServerProxy {
        name: name.to_string(),
        proxy_type: ProxyType::Tcp,
        remote_addr: format!(":{}", local_addr.port()),
        cancel,
        task,
        visitors: None,
    })
}

async fn accept_loop(
    listener: TcpListener,
    provider: Weak<dyn WorkConnProvider>,
    name: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => match result {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Proxy [{}] accepted user connection from {}", name, peer_addr);
                    let dst = socket.local_addr().ok();
                    tokio::spawn(handle_user_connection(
                        provider.clone(),
                        name.clone(),
                        Box::new(socket),
                        Some(peer_addr),
                        dst,
                    ));
                }
                Err(e) => {
                    tracing::warn!("Proxy [{}] accept failed: {}", name, e);
                }
            }
        }
    }
    tracing::debug!("Proxy [{}] stopped listening", name);
}
