//! Server-side proxies
//!
//! A proxy accepts user connections (public TCP for `tcp`, visitor streams
//! for `stcp`) and bridges each one to the owning client through a work
//! connection.

mod registry;
mod stcp;
mod tcp;

pub use registry::ProxyRegistry;
pub use stcp::start_stcp_proxy;
pub use tcp::start_tcp_proxy;

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hx_core::BoxedStream;
use hx_protocol::{write_message, ProxyType, StartWorkConnection};

use crate::error::ServerError;
use crate::visitor::VisitorManager;

/// Source of work connections for a proxy's user connections
#[async_trait]
pub trait WorkConnProvider: Send + Sync {
    async fn request_work_connection(&self) -> Result<BoxedStream, ServerError>;
}

/// A running server proxy owned by one control session
pub struct ServerProxy {
    name: String,
    proxy_type: ProxyType,
    remote_addr: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    visitors: Option<Arc<VisitorManager>>,
}

impl ServerProxy {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn proxy_type(&self) -> ProxyType {
        self.proxy_type
    }

    /// Public address reported to the client
    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    /// Stop accepting user connections.
    ///
    /// The returned handle completes once the accept task has released its
    /// listener. Connections already bridged keep running.
    pub fn close(self) -> JoinHandle<()> {
        self.cancel.cancel();
        if let Some(visitors) = &self.visitors {
            visitors.close_listener(&self.name);
        }
        tracing::debug!("Proxy [{}] closed", self.name);
        self.task
    }
}

impl std::fmt::Debug for ServerProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerProxy")
            .field("name", &self.name)
            .field("proxy_type", &self.proxy_type)
            .field("remote_addr", &self.remote_addr)
            .finish()
    }
}

/// Bridge one user connection through a fresh work connection
pub(crate) async fn handle_user_connection(
    provider: Weak<dyn WorkConnProvider>,
    proxy_name: String,
    mut user_conn: BoxedStream,
    src: Option<SocketAddr>,
    dst: Option<SocketAddr>,
) {
    let Some(session) = provider.upgrade() else {
        tracing::debug!("Proxy [{}] lost its control session", proxy_name);
        return;
    };

    let mut work_conn = match session.request_work_connection().await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!("Proxy [{}] failed to get work connection: {}", proxy_name, e);
            return;
        }
    };
    drop(session);

    let start = StartWorkConnection {
        proxy_name: proxy_name.clone(),
        src_addr: src.map(|a| a.ip().to_string()).unwrap_or_default(),
        src_port: src.map(|a| a.port()).unwrap_or_default(),
        dst_addr: dst.map(|a| a.ip().to_string()).unwrap_or_default(),
        dst_port: dst.map(|a| a.port()).unwrap_or_default(),
        error: String::new(),
    };
    if let Err(e) = write_message(&mut work_conn, &start.into()).await {
        tracing::warn!("Proxy [{}] failed to start work connection: {}", proxy_name, e);
        return;
    }

    match tokio::io::copy_bidirectional(&mut user_conn, &mut work_conn).await {
        Ok((to_client, to_user)) => tracing::debug!(
            "Proxy [{}] user connection done: {} bytes in, {} bytes out",
            proxy_name,
            to_client,
            to_user
        ),
        Err(e) => tracing::debug!("Proxy [{}] user connection error: {}", proxy_name, e),
    }
}
