//! One logged-in control connection
//!
//! A [`Control`] owns the dispatcher for the control stream and the proxy
//! manager whose wrappers register through it. It lives until the stream
//! closes; the service then logs in again and builds a new one.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use hx_core::auth::AuthScope;
use hx_core::config::{ClientConfig, ProxyConfig};
use hx_core::time::unix_timestamp;
use hx_core::BoxedStream;
use hx_protocol::{
    async_handler, Dispatcher, DispatcherHandle, Message, MessageType, NewProxyResponse, Ping,
    Pong,
};

use crate::connector::Connector;
use crate::event::{event_channel, forward_events};
use crate::proxy::{ProxyManager, ProxyStatus};

/// How often the pong deadline is checked
const HEARTBEAT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub struct Control {
    run_id: String,
    config: Arc<ClientConfig>,
    connector: Arc<Connector>,
    handle: DispatcherHandle,
    manager: ProxyManager,
    last_pong: Mutex<Instant>,
}

impl Control {
    /// Start serving a logged-in control stream
    pub fn start(
        run_id: String,
        stream: BoxedStream,
        config: Arc<ClientConfig>,
        connector: Arc<Connector>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = event_channel();
        let mut dispatcher = Dispatcher::new(stream);

        let control = Arc::new(Self {
            run_id,
            config,
            connector,
            handle: dispatcher.handle(),
            manager: ProxyManager::new(events_tx),
            last_pong: Mutex::new(Instant::now()),
        });

        let ctl = Arc::clone(&control);
        dispatcher.register_handler(
            MessageType::ReqWorkConnection,
            async_handler(move |_| {
                let ctl = Arc::clone(&ctl);
                async move { ctl.handle_req_work_conn().await }
            }),
        );

        let ctl = Arc::clone(&control);
        dispatcher.register_handler(
            MessageType::NewProxyResponse,
            Arc::new(move |msg| {
                if let Message::NewProxyResponse(resp) = msg {
                    ctl.handle_new_proxy_response(resp);
                }
            }),
        );

        let ctl = Arc::clone(&control);
        dispatcher.register_handler(
            MessageType::Pong,
            Arc::new(move |msg| {
                if let Message::Pong(pong) = msg {
                    ctl.handle_pong(pong);
                }
            }),
        );

        dispatcher.run();
        tokio::spawn(forward_events(events_rx, control.handle.clone()));
        tokio::spawn(Arc::clone(&control).heartbeat());

        tracing::info!(run_id = %control.run_id, "Control connection established");
        control
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn manager(&self) -> &ProxyManager {
        &self.manager
    }

    /// Reconcile this connection's proxies with `proxies`
    pub fn update_proxies(&self, proxies: &[ProxyConfig]) {
        self.manager.update_all(proxies);
    }

    pub fn status(&self) -> Vec<ProxyStatus> {
        self.manager.get_all_status()
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }

    /// Wait until the control stream has closed
    pub async fn closed(&self) {
        self.handle.closed().await
    }

    async fn handle_req_work_conn(&self) {
        match self.connector.dial_work_conn(&self.run_id).await {
            Ok((stream, start)) => {
                let name = start.proxy_name.clone();
                self.manager.handle_work_connection(&name, stream, start);
            }
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, "Work connection failed: {}", e);
            }
        }
    }

    fn handle_new_proxy_response(&self, resp: NewProxyResponse) {
        if let Err(e) = self
            .manager
            .start_proxy(&resp.proxy_name, &resp.remote_addr, &resp.error)
        {
            tracing::warn!(
                run_id = %self.run_id,
                "Ignoring response for proxy [{}]: {}",
                resp.proxy_name,
                e
            );
        }
    }

    fn handle_pong(&self, pong: Pong) {
        if !pong.error.is_empty() {
            tracing::error!(run_id = %self.run_id, "Pong error: {}", pong.error);
            self.close();
            return;
        }
        *self.last_pong.lock() = Instant::now();
        tracing::trace!(run_id = %self.run_id, "Receive heartbeat from server");
    }

    /// Send pings and enforce the pong deadline until the stream closes
    async fn heartbeat(self: Arc<Self>) {
        let interval = self.config.heartbeat_interval();
        let timeout = self.config.heartbeat_timeout();

        let mut ping_ticker = tokio::time::interval(interval.unwrap_or(HEARTBEAT_CHECK_INTERVAL));
        let mut check_ticker = tokio::time::interval(HEARTBEAT_CHECK_INTERVAL);

        loop {
            tokio::select! {
                _ = self.handle.closed() => break,
                _ = ping_ticker.tick(), if interval.is_some() => {
                    let timestamp = unix_timestamp();
                    let privilege_key = if self.config.auth.has_scope(AuthScope::HeartBeats) {
                        self.config.auth.privilege_key(timestamp)
                    } else {
                        String::new()
                    };
                    tracing::trace!(run_id = %self.run_id, "Send heartbeat to server");
                    if self.handle.send(Ping { privilege_key, timestamp }).await.is_err() {
                        break;
                    }
                }
                _ = check_ticker.tick(), if timeout.is_some() => {
                    let elapsed = self.last_pong.lock().elapsed();
                    if timeout.is_some_and(|t| elapsed > t) {
                        tracing::warn!(run_id = %self.run_id, "Heartbeat timeout after {:?}", elapsed);
                        self.close();
                        break;
                    }
                }
            }
        }

        self.manager.close();
        tracing::info!(run_id = %self.run_id, "Control connection closed");
    }
}

impl std::fmt::Debug for Control {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Control")
            .field("run_id", &self.run_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
