//! Per-client control session
//!
//! One session exists per logged-in client. It owns the control stream
//! (through its dispatcher), the proxies the client registered, and the pool
//! of work connections the client has dialed back.
//!
//! # Lifecycle
//!
//! `Pending` (constructed, registered) → `Active` (login answered, dispatcher
//! running) → `Closed` (terminal). [`ControlSession::close`] may be called
//! from any state and from any task; the closed signal fires once teardown
//! has released every listener.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use hx_core::config::ServerConfig;
use hx_core::{generate_response_error, AuthError, BoxedStream, RunId};
use hx_protocol::{
    write_message, CloseProxy, Dispatcher, DispatcherHandle, Login, LoginResponse, Message,
    NewProxy, NewProxyResponse, NewWorkConnection, Ping, Pong, ProxyOptions, ReqWorkConnection,
    PROTOCOL_VERSION,
};

use crate::auth::Verifier;
use crate::error::ServerError;
use crate::proxy::{start_stcp_proxy, start_tcp_proxy, ProxyRegistry, ServerProxy, WorkConnProvider};
use crate::visitor::VisitorManager;

/// Idle work connections kept beyond the client's requested pool size
const IDLE_POOL_HEADROOM: usize = 10;

/// How often the heartbeat deadline is checked
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle state of a control session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Active,
    Closed,
}

/// Work connections dialed by the client and callers waiting for one
#[derive(Default)]
struct WorkConnPool {
    /// Callers waiting for a connection, oldest first
    waiters: VecDeque<oneshot::Sender<BoxedStream>>,
    /// Connections that arrived with nobody waiting
    idle: VecDeque<BoxedStream>,
}

/// Shared services a session needs from the server
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<ServerConfig>,
    pub registry: Arc<ProxyRegistry>,
    pub visitors: Arc<VisitorManager>,
}

/// Server side of one client's control connection
pub struct ControlSession {
    run_id: RunId,
    login: Login,
    verifier: Arc<dyn Verifier>,
    ctx: SessionContext,
    pool_count: usize,

    state: Mutex<SessionState>,
    dispatcher: Mutex<Option<DispatcherHandle>>,
    proxies: Mutex<HashMap<String, ServerProxy>>,
    work_conns: Mutex<WorkConnPool>,
    last_ping: Mutex<Instant>,

    /// Fired when close is requested
    close_requested: CancellationToken,
    /// Fired when teardown has finished
    closed: CancellationToken,
}

impl ControlSession {
    /// Create a session in the `Pending` state
    pub fn new(
        run_id: RunId,
        login: Login,
        verifier: Arc<dyn Verifier>,
        pool_count: u32,
        ctx: SessionContext,
    ) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            login,
            verifier,
            ctx,
            pool_count: pool_count as usize,
            state: Mutex::new(SessionState::Pending),
            dispatcher: Mutex::new(None),
            proxies: Mutex::new(HashMap::new()),
            work_conns: Mutex::new(WorkConnPool::default()),
            last_ping: Mutex::new(Instant::now()),
            close_requested: CancellationToken::new(),
            closed: CancellationToken::new(),
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// User name the client logged in with
    pub fn user(&self) -> &str {
        &self.login.user
    }

    pub fn login(&self) -> &Login {
        &self.login
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    /// Names of the proxies this session currently owns
    pub fn proxy_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.proxies.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of idle pooled work connections
    pub fn idle_work_conns(&self) -> usize {
        self.work_conns.lock().idle.len()
    }

    /// Number of callers waiting for a work connection
    pub fn pending_work_conn_requests(&self) -> usize {
        self.work_conns.lock().waiters.len()
    }

    /// Wait until teardown has finished
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await
    }

    /// Answer the login and start serving the control stream.
    ///
    /// Fails with `SessionClosed` if the session was superseded before it
    /// could start.
    pub async fn start(self: &Arc<Self>, mut stream: BoxedStream) -> Result<(), ServerError> {
        if self.state() != SessionState::Pending {
            return Err(ServerError::SessionClosed);
        }

        let response = LoginResponse {
            version: PROTOCOL_VERSION.to_string(),
            run_id: self.run_id.to_string(),
            error: String::new(),
        };
        write_message(&mut stream, &response.into()).await?;

        let (msg_tx, msg_rx) = mpsc::unbounded_channel();
        let mut dispatcher = Dispatcher::new(stream);
        dispatcher.register_default_handler(Arc::new(move |msg| {
            let _ = msg_tx.send(msg);
        }));
        let handle = dispatcher.run();

        {
            let mut state = self.state.lock();
            if *state != SessionState::Pending {
                handle.close();
                return Err(ServerError::SessionClosed);
            }
            *state = SessionState::Active;
            *self.dispatcher.lock() = Some(handle.clone());
        }
        *self.last_ping.lock() = Instant::now();
        tracing::info!(run_id = %self.run_id, "Control session active");

        for _ in 0..self.pool_count {
            if handle.try_send(ReqWorkConnection {}).is_err() {
                break;
            }
        }

        tokio::spawn(Arc::clone(self).message_loop(msg_rx));
        tokio::spawn(Arc::clone(self).supervise(handle));
        Ok(())
    }

    /// Process control messages in arrival order
    async fn message_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Message>) {
        loop {
            let msg = tokio::select! {
                _ = self.close_requested.cancelled() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            match msg {
                Message::NewProxy(m) => self.handle_new_proxy(m).await,
                Message::CloseProxy(m) => self.handle_close_proxy(m),
                Message::Ping(m) => self.handle_ping(m).await,
                other => tracing::debug!(
                    run_id = %self.run_id,
                    "Ignoring unexpected {:?} on control stream",
                    other.message_type()
                ),
            }
        }
    }

    /// Close the session when the stream ends or heartbeats stop
    async fn supervise(self: Arc<Self>, handle: DispatcherHandle) {
        let heartbeat_timeout = self.ctx.config.heartbeat_timeout();
        let mut ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = self.close_requested.cancelled() => break,
                _ = handle.closed() => {
                    tracing::info!(run_id = %self.run_id, "Control connection closed");
                    break;
                }
                _ = ticker.tick(), if heartbeat_timeout.is_some() => {
                    let elapsed = self.last_ping.lock().elapsed();
                    if heartbeat_timeout.is_some_and(|t| elapsed > t) {
                        tracing::warn!(run_id = %self.run_id, "Heartbeat timeout after {:?}", elapsed);
                        break;
                    }
                }
            }
        }

        self.close();
    }

    async fn handle_new_proxy(self: &Arc<Self>, msg: NewProxy) {
        let proxy_name = msg.proxy_name.clone();
        let response = match self.register_proxy(msg).await {
            Ok(remote_addr) => {
                tracing::info!(run_id = %self.run_id, "New proxy [{}] success", proxy_name);
                NewProxyResponse {
                    proxy_name,
                    remote_addr,
                    error: String::new(),
                }
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, "New proxy [{}] error: {}", proxy_name, e);
                NewProxyResponse {
                    error: generate_response_error(
                        &format!("new proxy [{}] error", proxy_name),
                        &e,
                        self.ctx.config.detailed_errors_to_client,
                    ),
                    proxy_name,
                    remote_addr: String::new(),
                }
            }
        };
        self.send(response).await;
    }

    fn handle_close_proxy(&self, msg: CloseProxy) {
        if self.close_proxy(&msg.proxy_name) {
            tracing::info!(run_id = %self.run_id, "Close proxy [{}] success", msg.proxy_name);
        }
    }

    async fn handle_ping(&self, msg: Ping) {
        if let Err(e) = self.verifier.verify_ping(&msg) {
            tracing::warn!(run_id = %self.run_id, "Invalid ping: {}", e);
            self.send(Pong {
                error: generate_response_error(
                    "invalid ping",
                    &e,
                    self.ctx.config.detailed_errors_to_client,
                ),
            })
            .await;
            // Taken first so close leaves the queued Pong to be written
            if let Some(handle) = self.dispatcher.lock().take() {
                handle.close_after_flush();
            }
            self.close();
            return;
        }

        *self.last_ping.lock() = Instant::now();
        tracing::trace!(run_id = %self.run_id, "Receive heartbeat");
        self.send(Pong::default()).await;
    }

    async fn send(&self, msg: impl Into<Message>) {
        let handle = self.dispatcher.lock().clone();
        if let Some(handle) = handle {
            if let Err(e) = handle.send(msg).await {
                tracing::debug!(run_id = %self.run_id, "Send on control stream failed: {}", e);
            }
        }
    }

    /// Validate, claim and start a proxy; returns its public address
    pub async fn register_proxy(self: &Arc<Self>, msg: NewProxy) -> Result<String, ServerError> {
        if self.state() != SessionState::Active {
            return Err(ServerError::SessionClosed);
        }
        if msg.proxy_name.is_empty() {
            return Err(ServerError::InvalidProxy {
                name: msg.proxy_name,
                reason: "name must not be empty".to_string(),
            });
        }

        self.ctx.registry.claim(&msg.proxy_name, &self.run_id)?;

        let provider: Weak<dyn WorkConnProvider> = {
            let strong: Arc<dyn WorkConnProvider> = Arc::clone(self) as Arc<dyn WorkConnProvider>;
            Arc::downgrade(&strong)
        };
        let built = match &msg.options {
            ProxyOptions::Tcp(opts) => {
                start_tcp_proxy(provider, &msg.proxy_name, opts, &self.ctx.config).await
            }
            ProxyOptions::Stcp(opts) => start_stcp_proxy(
                provider,
                &msg.proxy_name,
                opts,
                self.user(),
                Arc::clone(&self.ctx.visitors),
            ),
        };

        let proxy = match built {
            Ok(proxy) => proxy,
            Err(e) => {
                self.ctx.registry.release(&msg.proxy_name, &self.run_id);
                return Err(e);
            }
        };

        let remote_addr = proxy.remote_addr().to_string();
        let mut proxies = self.proxies.lock();
        if self.state() != SessionState::Active {
            drop(proxies);
            let _ = proxy.close();
            self.ctx.registry.release(&msg.proxy_name, &self.run_id);
            return Err(ServerError::SessionClosed);
        }
        proxies.insert(msg.proxy_name, proxy);
        Ok(remote_addr)
    }

    /// Stop and release a proxy owned by this session
    pub fn close_proxy(&self, name: &str) -> bool {
        let Some(proxy) = self.proxies.lock().remove(name) else {
            return false;
        };
        let _ = proxy.close();
        self.ctx.registry.release(name, &self.run_id);
        true
    }

    /// Check the credentials on a work connection against this session's verifier
    pub fn verify_new_work_conn(&self, msg: &NewWorkConnection) -> Result<(), AuthError> {
        self.verifier.verify_new_work_conn(msg)
    }

    /// Hand an inbound work connection to the oldest waiter, or pool it
    pub fn register_work_conn(&self, stream: BoxedStream) -> Result<(), ServerError> {
        let mut pool = self.work_conns.lock();
        if self.state() == SessionState::Closed {
            return Err(ServerError::SessionClosed);
        }

        let mut stream = stream;
        while let Some(waiter) = pool.waiters.pop_front() {
            match waiter.send(stream) {
                Ok(()) => return Ok(()),
                // The waiter timed out; try the next one
                Err(returned) => stream = returned,
            }
        }

        if pool.idle.len() < self.pool_count + IDLE_POOL_HEADROOM {
            pool.idle.push_back(stream);
        } else {
            tracing::debug!(run_id = %self.run_id, "Work connection pool full, dropping connection");
        }
        Ok(())
    }

    /// Get a work connection, asking the client for one if none is pooled.
    ///
    /// Waits at most `work_conn_timeout`.
    pub async fn request_work_connection(&self) -> Result<BoxedStream, ServerError> {
        let rx = {
            let mut pool = self.work_conns.lock();
            if self.state() == SessionState::Closed {
                return Err(ServerError::SessionClosed);
            }
            match pool.idle.pop_front() {
                Some(conn) => {
                    drop(pool);
                    // Replace the connection just taken
                    self.request_from_client();
                    return Ok(conn);
                }
                None => {
                    let (tx, rx) = oneshot::channel();
                    pool.waiters.push_back(tx);
                    rx
                }
            }
        };

        self.request_from_client();

        match tokio::time::timeout(self.ctx.config.work_conn_timeout, rx).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(_)) => Err(ServerError::SessionClosed),
            Err(_) => Err(ServerError::WorkConnTimeout),
        }
    }

    fn request_from_client(&self) {
        let handle = self.dispatcher.lock().clone();
        if let Some(handle) = handle {
            if let Err(e) = handle.try_send(ReqWorkConnection {}) {
                tracing::debug!(run_id = %self.run_id, "Failed to request work connection: {}", e);
            }
        }
    }

    /// Tear the session down.
    ///
    /// Idempotent. Closes the dispatcher, stops every proxy and releases its
    /// name, and wakes all work connection waiters with `SessionClosed`. The
    /// closed signal fires after every proxy listener has been dropped.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.close_requested.cancel();

        if let Some(handle) = self.dispatcher.lock().take() {
            handle.close();
        }

        let proxies: Vec<(String, ServerProxy)> = self.proxies.lock().drain().collect();
        let mut tasks = Vec::with_capacity(proxies.len());
        for (name, proxy) in proxies {
            tasks.push(proxy.close());
            self.ctx.registry.release(&name, &self.run_id);
        }

        {
            let mut pool = self.work_conns.lock();
            pool.waiters.clear();
            pool.idle.clear();
        }

        tracing::info!(run_id = %self.run_id, "Control session closed");

        let closed = self.closed.clone();
        tokio::spawn(async move {
            for task in tasks {
                let _ = task.await;
            }
            closed.cancel();
        });
    }
}

#[async_trait]
impl WorkConnProvider for ControlSession {
    async fn request_work_connection(&self) -> Result<BoxedStream, ServerError> {
        ControlSession::request_work_connection(self).await
    }
}

impl std::fmt::Debug for ControlSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSession")
            .field("run_id", &self.run_id)
            .field("user", &self.login.user)
            .field("state", &self.state())
            .finish()
    }
}
