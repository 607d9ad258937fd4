//! Outbound connections to the server
//!
//! Every stream the client opens starts with one message naming its
//! purpose: `Login` for the control stream, `NewWorkConnection` for a work
//! connection, `NewVisitorConnection` for a visitor.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use hx_core::auth::auth_key;
use hx_core::config::{ClientConfig, VisitorConfig};
use hx_core::time::unix_timestamp;
use hx_core::types::HostInfo;
use hx_core::BoxedStream;
use hx_protocol::{
    read_message, write_message, ClientSpec, Login, LoginResponse, Message, NewVisitorConnection,
    NewWorkConnection, StartWorkConnection, PROTOCOL_VERSION,
};

use crate::error::ClientError;

/// How long the server may take to answer a login or visitor request
pub const CONN_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Dials the server on behalf of one client
pub struct Connector {
    config: Arc<ClientConfig>,
    host: HostInfo,
}

impl Connector {
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            config,
            host: HostInfo::detect(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Open a raw stream to the server
    pub async fn dial(&self) -> Result<BoxedStream, ClientError> {
        let addr = self.config.server_address();
        let stream = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| ClientError::Timeout("dial"))??;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(Box::new(stream))
    }

    /// Dial and log in; returns the control stream and the server's answer.
    ///
    /// An empty `run_id` asks the server to assign one.
    pub async fn login(&self, run_id: &str) -> Result<(BoxedStream, LoginResponse), ClientError> {
        let mut stream = self.dial().await?;

        let timestamp = unix_timestamp();
        let login = Login {
            version: PROTOCOL_VERSION.to_string(),
            hostname: self.host.hostname.clone(),
            os: self.host.os.clone(),
            arch: self.host.arch.clone(),
            user: self.config.user.clone(),
            privilege_key: self.config.auth.privilege_key(timestamp),
            timestamp,
            run_id: run_id.to_string(),
            client_spec: ClientSpec::default(),
            metas: self.config.metas.clone(),
            pool_count: self.config.pool_count,
        };
        write_message(&mut stream, &login.into()).await?;

        let response = match read_with_timeout(&mut stream).await? {
            Message::LoginResponse(resp) => resp,
            other => {
                return Err(ClientError::UnexpectedMessage {
                    expected: "LoginResponse",
                    got: other.message_type(),
                })
            }
        };

        if !response.error.is_empty() {
            return Err(ClientError::LoginRejected(response.error));
        }
        Ok((stream, response))
    }

    /// Dial a work connection and wait until the server pairs it with a user.
    ///
    /// There is no deadline on the pairing: pooled connections may sit idle
    /// on the server for a long time.
    pub async fn dial_work_conn(&self, run_id: &str) -> Result<(BoxedStream, StartWorkConnection), ClientError> {
        let mut stream = self.dial().await?;

        let timestamp = unix_timestamp();
        let msg = NewWorkConnection {
            run_id: run_id.to_string(),
            privilege_key: self.config.auth.privilege_key(timestamp),
            timestamp,
        };
        write_message(&mut stream, &msg.into()).await?;

        match read_message(&mut stream).await? {
            Message::StartWorkConnection(start) if start.error.is_empty() => Ok((stream, start)),
            Message::StartWorkConnection(start) => Err(ClientError::WorkConnRejected(start.error)),
            other => Err(ClientError::UnexpectedMessage {
                expected: "StartWorkConnection",
                got: other.message_type(),
            }),
        }
    }

    /// Dial the server as a visitor of a secret proxy
    pub async fn dial_visitor(&self, run_id: &str, visitor: &VisitorConfig) -> Result<BoxedStream, ClientError> {
        let mut stream = self.dial().await?;

        let timestamp = unix_timestamp();
        let msg = NewVisitorConnection {
            run_id: run_id.to_string(),
            proxy_name: visitor.server_name.clone(),
            sign_key: auth_key(&visitor.secret_key, timestamp),
            timestamp,
            use_encryption: visitor.use_encryption,
            use_compression: visitor.use_compression,
        };
        write_message(&mut stream, &msg.into()).await?;

        match read_with_timeout(&mut stream).await? {
            Message::NewVisitorConnectionResponse(resp) if resp.error.is_empty() => Ok(stream),
            Message::NewVisitorConnectionResponse(resp) => Err(ClientError::VisitorRejected(resp.error)),
            other => Err(ClientError::UnexpectedMessage {
                expected: "NewVisitorConnectionResponse",
                got: other.message_type(),
            }),
        }
    }
}

async fn read_with_timeout(stream: &mut BoxedStream) -> Result<Message, ClientError> {
    tokio::time::timeout(CONN_READ_TIMEOUT, read_message(stream))
        .await
        .map_err(|_| ClientError::Timeout("server response"))?
        .map_err(ClientError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_core::auth::AuthConfig;
    use tokio::net::TcpListener;

    async fn fake_server() -> (TcpListener, Arc<ClientConfig>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ClientConfig {
            server_addr: "127.0.0.1".to_string(),
            server_port: port,
            user: "alice".to_string(),
            auth: AuthConfig {
                token: "t0ken".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        (listener, Arc::new(config))
    }

    #[tokio::test]
    async fn test_login_sends_signed_login() {
        let (listener, config) = fake_server().await;
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let login = match read_message(&mut socket).await.unwrap() {
                Message::Login(login) => login,
                other => panic!("expected Login, got {:?}", other),
            };
            assert_eq!(login.user, "alice");
            assert_eq!(login.privilege_key, auth_key("t0ken", login.timestamp));
            assert_eq!(login.run_id, "prev");

            let resp = LoginResponse {
                version: PROTOCOL_VERSION.to_string(),
                run_id: login.run_id,
                error: String::new(),
            };
            write_message(&mut socket, &resp.into()).await.unwrap();
        });

        let connector = Connector::new(config);
        let (_stream, resp) = connector.login("prev").await.unwrap();
        assert_eq!(resp.run_id, "prev");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let (listener, config) = fake_server().await;
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _ = read_message(&mut socket).await.unwrap();
            let resp = LoginResponse {
                error: "invalid token".to_string(),
                ..Default::default()
            };
            write_message(&mut socket, &resp.into()).await.unwrap();
        });

        let connector = Connector::new(config);
        match connector.login("").await {
            Err(ClientError::LoginRejected(msg)) => assert_eq!(msg, "invalid token"),
            other => panic!("expected LoginRejected, got {:?}", other.map(|(_, r)| r)),
        }
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let (listener, config) = fake_server().await;
        drop(listener);

        let connector = Connector::new(config);
        assert!(matches!(connector.dial().await, Err(ClientError::Io(_))));
    }
}
