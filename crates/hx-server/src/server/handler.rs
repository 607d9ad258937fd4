//! First-message routing for accepted streams

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hx_core::BoxedStream;
use hx_protocol::{read_message, Message};

use crate::service::Service;

/// How long a new stream may take to send its first message
pub const CONN_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) async fn handle_connection(
    service: Arc<Service>,
    mut stream: BoxedStream,
    internal: bool,
    peer_addr: Option<SocketAddr>,
) {
    let peer = peer_addr
        .map(|a| a.to_string())
        .unwrap_or_else(|| "internal".to_string());

    let first = match tokio::time::timeout(CONN_READ_TIMEOUT, read_message(&mut stream)).await {
        Ok(Ok(msg)) => msg,
        Ok(Err(e)) => {
            if !e.is_eof() {
                tracing::debug!("Failed to read first message from {}: {}", peer, e);
            }
            return;
        }
        Err(_) => {
            tracing::debug!("Timed out waiting for first message from {}", peer);
            return;
        }
    };

    match first {
        Message::Login(login) => {
            if let Err(e) = service.register_control(stream, login, internal).await {
                tracing::warn!("Register control from {} failed: {}", peer, e);
            }
        }
        Message::NewWorkConnection(msg) => {
            if let Err(e) = service.register_work_conn(stream, msg).await {
                tracing::warn!("Register work connection from {} failed: {}", peer, e);
            }
        }
        Message::NewVisitorConnection(msg) => {
            let proxy_name = msg.proxy_name.clone();
            if let Err(e) = service.register_visitor_conn(stream, msg).await {
                tracing::warn!(
                    "Visitor connection from {} for proxy [{}] failed: {}",
                    peer,
                    proxy_name,
                    e
                );
            }
        }
        other => {
            tracing::warn!(
                "Unexpected first message {:?} from {}",
                other.message_type(),
                peer
            );
        }
    }
}
