//! Local listeners for secret (`stcp`) proxies
//!
//! Each visitor listens locally. Every accepted connection is carried to the
//! server on its own stream, signed with the proxy's secret key, and bridged
//! to the owning client's local service from there.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use hx_core::config::VisitorConfig;

use crate::connector::Connector;
use crate::error::ClientError;

/// The client's current run id, shared with visitors so the server can
/// resolve the visiting user
pub type SharedRunId = Arc<Mutex<String>>;

pub struct StcpVisitor {
    config: VisitorConfig,
    connector: Arc<Connector>,
    run_id: SharedRunId,
    listener: TcpListener,
}

impl StcpVisitor {
    /// Bind the visitor's local address
    pub async fn bind(
        config: VisitorConfig,
        connector: Arc<Connector>,
        run_id: SharedRunId,
    ) -> Result<Self, ClientError> {
        let listener = TcpListener::bind(config.bind_address()).await?;
        tracing::info!(
            "Visitor [{}] for proxy [{}] listening on {}",
            config.name,
            config.server_name,
            listener.local_addr()?
        );
        Ok(Self {
            config,
            connector,
            run_id,
            listener,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept local connections until cancelled
    pub async fn run(self, cancel: CancellationToken) {
        let this = Arc::new(self);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = this.listener.accept() => match result {
                    Ok((socket, peer_addr)) => {
                        tracing::debug!("Visitor [{}] accepted {}", this.config.name, peer_addr);
                        tokio::spawn(Arc::clone(&this).handle_conn(socket));
                    }
                    Err(e) => {
                        tracing::warn!("Visitor [{}] accept failed: {}", this.config.name, e);
                    }
                }
            }
        }
        tracing::debug!("Visitor [{}] stopped", this.config.name);
    }

    async fn handle_conn(self: Arc<Self>, mut local: TcpStream) {
        let run_id = self.run_id.lock().clone();
        let mut remote = match self.connector.dial_visitor(&run_id, &self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    "Visitor [{}] failed to reach proxy [{}]: {}",
                    self.config.name,
                    self.config.server_name,
                    e
                );
                return;
            }
        };

        if let Err(e) = tokio::io::copy_bidirectional(&mut local, &mut remote).await {
            tracing::debug!("Visitor [{}] connection error: {}", self.config.name, e);
        }
    }
}

/// Bind and run every configured visitor
pub async fn start_visitors(
    configs: &[VisitorConfig],
    connector: &Arc<Connector>,
    run_id: &SharedRunId,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    for config in configs {
        let visitor = StcpVisitor::bind(config.clone(), Arc::clone(connector), Arc::clone(run_id)).await?;
        tokio::spawn(visitor.run(cancel.clone()));
    }
    Ok(())
}
