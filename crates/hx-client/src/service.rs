//! Client service: login loop and configuration entry points

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use hx_core::config::{ClientConfig, ProxyConfig};

use crate::connector::Connector;
use crate::control::Control;
use crate::error::ClientError;
use crate::proxy::ProxyStatus;
use crate::reconnect::ExponentialBackoff;
use crate::visitor::{start_visitors, SharedRunId};

/// Keeps one control connection alive and its proxies in sync
pub struct Service {
    config: Arc<ClientConfig>,
    connector: Arc<Connector>,
    run_id: SharedRunId,
    proxies: Mutex<Vec<ProxyConfig>>,
    control: Mutex<Option<Arc<Control>>>,
    cancel: CancellationToken,
}

impl Service {
    pub fn new(config: ClientConfig) -> Self {
        let proxies = config.proxies.clone();
        let config = Arc::new(config);
        Self {
            connector: Arc::new(Connector::new(Arc::clone(&config))),
            config,
            run_id: Arc::new(Mutex::new(String::new())),
            proxies: Mutex::new(proxies),
            control: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run id assigned by the server, empty before the first login
    pub fn run_id(&self) -> String {
        self.run_id.lock().clone()
    }

    /// The current control connection, if logged in
    pub fn control(&self) -> Option<Arc<Control>> {
        self.control.lock().clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Log in and stay logged in until closed.
    ///
    /// With `login_fail_exit` a failed first login is returned as an error;
    /// afterwards every failure is retried with backoff. The run id from the
    /// first login is reused on every reconnect.
    pub async fn run(&self) -> Result<(), ClientError> {
        start_visitors(&self.config.visitors, &self.connector, &self.run_id, &self.cancel).await?;

        let mut backoff = ExponentialBackoff::from_config(&self.config.backoff);
        let mut logged_in_once = false;

        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = self.login() => result,
            };

            match result {
                Ok(control) => {
                    logged_in_once = true;
                    backoff.reset();
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            control.close();
                            break;
                        }
                        _ = control.closed() => {
                            tracing::warn!("Control connection lost, reconnecting");
                        }
                    }
                }
                Err(e) => {
                    if !logged_in_once && self.config.login_fail_exit {
                        return Err(e);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!("Login to server failed: {}. Retrying in {:?}", e, delay);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.close_control();
        tracing::info!("Client stopped");
        Ok(())
    }

    async fn login(&self) -> Result<Arc<Control>, ClientError> {
        let run_id = self.run_id();
        let (stream, response) = self.connector.login(&run_id).await?;
        *self.run_id.lock() = response.run_id.clone();
        tracing::info!(
            run_id = %response.run_id,
            "Login to server success, server version [{}]",
            response.version
        );

        let control = Control::start(
            response.run_id,
            stream,
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
        );

        if let Some(old) = self.control.lock().replace(Arc::clone(&control)) {
            old.close();
        }
        let proxies = self.proxies.lock().clone();
        control.update_proxies(&proxies);
        Ok(control)
    }

    /// Replace the desired proxy set and reconcile the live connection
    pub fn update_proxies(&self, proxies: Vec<ProxyConfig>) {
        *self.proxies.lock() = proxies.clone();
        if let Some(control) = self.control() {
            control.update_proxies(&proxies);
        }
    }

    /// Status of every proxy on the current connection
    pub fn status(&self) -> Vec<ProxyStatus> {
        self.control().map(|c| c.status()).unwrap_or_default()
    }

    /// Stop the login loop and close the control connection
    pub fn close(&self) {
        self.cancel.cancel();
        self.close_control();
    }

    fn close_control(&self) {
        if let Some(control) = self.control.lock().take() {
            control.close();
        }
    }
}
