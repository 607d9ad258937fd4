//! Server service: shared state and connection registration

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use hx_core::config::ServerConfig;
use hx_core::{generate_response_error, new_run_id, BoxedStream, RunId};
use hx_protocol::{
    write_message, Login, LoginResponse, NewVisitorConnection, NewVisitorConnectionResponse,
    NewWorkConnection, StartWorkConnection, PROTOCOL_VERSION,
};

use crate::auth::{new_verifier, AlwaysPassVerifier, Verifier};
use crate::control::{ControlManager, ControlSession, SessionContext};
use crate::error::ServerError;
use crate::proxy::ProxyRegistry;
use crate::visitor::VisitorManager;

/// The rendezvous server
pub struct Service {
    pub(crate) config: Arc<ServerConfig>,
    controls: Arc<ControlManager>,
    registry: Arc<ProxyRegistry>,
    visitors: Arc<VisitorManager>,
    verifier: Arc<dyn Verifier>,
    pub(crate) cancel: CancellationToken,
}

impl Service {
    /// Create a service from configuration
    pub fn new(config: ServerConfig) -> Self {
        let verifier = new_verifier(&config.auth);
        Self {
            config: Arc::new(config),
            controls: Arc::new(ControlManager::new()),
            registry: Arc::new(ProxyRegistry::new()),
            visitors: Arc::new(VisitorManager::new()),
            verifier,
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn controls(&self) -> &Arc<ControlManager> {
        &self.controls
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    pub fn visitors(&self) -> &Arc<VisitorManager> {
        &self.visitors
    }

    /// Token that stops the listener when cancelled
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop accepting connections and close every session
    pub async fn close(&self) {
        self.cancel.cancel();
        self.controls.close_all().await;
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            config: Arc::clone(&self.config),
            registry: Arc::clone(&self.registry),
            visitors: Arc::clone(&self.visitors),
        }
    }

    fn response_error(&self, msg: &str, err: &ServerError) -> String {
        generate_response_error(msg, err, self.config.detailed_errors_to_client)
    }

    /// Authenticate a login and start its control session.
    ///
    /// `internal` marks trusted in-process transports; only those may skip
    /// authentication via `always_auth_pass`. On failure a `LoginResponse`
    /// carrying the error is written before the stream is dropped.
    pub async fn register_control(
        &self,
        mut stream: BoxedStream,
        login: Login,
        internal: bool,
    ) -> Result<Arc<ControlSession>, ServerError> {
        let result = self.prepare_control(login, internal).await;
        let session = match result {
            Ok(session) => session,
            Err(e) => {
                let response = LoginResponse {
                    version: PROTOCOL_VERSION.to_string(),
                    run_id: String::new(),
                    error: self.response_error("invalid login", &e),
                };
                let _ = write_message(&mut stream, &response.into()).await;
                return Err(e);
            }
        };

        if let Err(e) = session.start(stream).await {
            session.close();
            self.controls.del(session.run_id(), &session).await;
            return Err(e);
        }

        let controls = Arc::clone(&self.controls);
        let watched = Arc::clone(&session);
        tokio::spawn(async move {
            watched.wait_closed().await;
            controls.del(watched.run_id(), &watched).await;
        });

        Ok(session)
    }

    async fn prepare_control(
        &self,
        mut login: Login,
        internal: bool,
    ) -> Result<Arc<ControlSession>, ServerError> {
        if login.run_id.is_empty() {
            login.run_id = new_run_id()
                .map_err(|e| ServerError::IdAllocation(e.to_string()))?
                .to_string();
        }
        let run_id = RunId::new(login.run_id.clone());

        let verifier: Arc<dyn Verifier> = if internal && login.client_spec.always_auth_pass {
            Arc::new(AlwaysPassVerifier)
        } else {
            Arc::clone(&self.verifier)
        };
        verifier.verify_login(&login)?;

        tracing::info!(
            run_id = %run_id,
            "Client login: user [{}] hostname [{}] os [{}] arch [{}] version [{}]",
            login.user,
            login.hostname,
            login.os,
            login.arch,
            login.version
        );

        let pool_count = login.pool_count.min(self.config.max_pool_count);
        let session = ControlSession::new(
            run_id.clone(),
            login,
            verifier,
            pool_count,
            self.session_context(),
        );

        if let Some(old) = self.controls.add(run_id, Arc::clone(&session)).await {
            old.wait_closed().await;
        }

        Ok(session)
    }

    /// Attach a work connection dialed by a client to its session
    pub async fn register_work_conn(
        &self,
        mut stream: BoxedStream,
        msg: NewWorkConnection,
    ) -> Result<(), ServerError> {
        let run_id = RunId::new(msg.run_id.clone());
        let result = match self.controls.get_by_id(&run_id).await {
            Some(session) => session
                .verify_new_work_conn(&msg)
                .map_err(ServerError::from)
                .map(|()| session),
            None => Err(ServerError::ControlNotFound(msg.run_id.clone())),
        };

        match result {
            Ok(session) => session.register_work_conn(stream),
            Err(e) => {
                let response = StartWorkConnection {
                    error: self.response_error("invalid new work connection", &e),
                    ..Default::default()
                };
                let _ = write_message(&mut stream, &response.into()).await;
                Err(e)
            }
        }
    }

    /// Authenticate a visitor and hand its stream to the target proxy
    pub async fn register_visitor_conn(
        &self,
        mut stream: BoxedStream,
        msg: NewVisitorConnection,
    ) -> Result<(), ServerError> {
        let result = self.authorize_visitor(&msg).await;

        let response = NewVisitorConnectionResponse {
            proxy_name: msg.proxy_name.clone(),
            error: match &result {
                Ok(_) => String::new(),
                Err(e) => self.response_error("visitor connection rejected", e),
            },
        };
        write_message(&mut stream, &response.into()).await?;

        let tx = result?;
        tx.send(stream)
            .await
            .map_err(|_| ServerError::SessionClosed)
    }

    async fn authorize_visitor(
        &self,
        msg: &NewVisitorConnection,
    ) -> Result<tokio::sync::mpsc::Sender<BoxedStream>, ServerError> {
        let visitor_user = if msg.run_id.is_empty() {
            String::new()
        } else {
            let run_id = RunId::new(msg.run_id.clone());
            self.controls
                .get_by_id(&run_id)
                .await
                .map(|s| s.user().to_string())
                .ok_or_else(|| ServerError::ControlNotFound(msg.run_id.clone()))?
        };

        self.visitors
            .authorize(&msg.proxy_name, &msg.sign_key, msg.timestamp, &visitor_user)
    }
}
