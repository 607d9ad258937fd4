//! TCP listener for client connections

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};

use hx_core::BoxedStream;

use crate::error::ServerError;
use crate::server::handler::handle_connection;
use crate::service::Service;

impl Service {
    /// Bind the configured control address
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = self.config.bind_address();
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("hxs listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept client connections until the service is closed
    pub async fn run(self: &Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("Listener shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.accept(socket, peer_addr),
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }

    fn accept(self: &Arc<Self>, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::debug!("New connection from {}", peer_addr);
        if let Err(e) = socket.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            handle_connection(service, Box::new(socket), false, Some(peer_addr)).await;
        });
    }

    /// Serve a stream from a trusted in-process transport.
    ///
    /// Logins arriving here may request `always_auth_pass`.
    pub fn handle_internal_connection(self: &Arc<Self>, stream: BoxedStream) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            handle_connection(service, stream, true, None).await;
        });
    }
}
