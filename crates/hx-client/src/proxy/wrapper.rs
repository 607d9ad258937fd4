//! One configured proxy and its registration lifecycle

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use hx_core::config::ProxyConfig;
use hx_core::BoxedStream;
use hx_protocol::{CloseProxy, StartWorkConnection};

use super::worker::serve_work_conn;
use super::{ProxyPhase, ProxyStatus};
use crate::error::ClientError;
use crate::event::{EventSender, ProxyEvent};

/// How often the registration state is checked
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Re-send `NewProxy` if the server has not answered within this long
pub const WAIT_START_RESEND: Duration = Duration::from_secs(20);

/// Retry a refused registration after this long
pub const START_ERROR_RETRY: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct WrapperState {
    phase: ProxyPhase,
    remote_addr: String,
    error: String,
    last_send_start: Option<Instant>,
    last_start_error: Option<Instant>,
}

/// Owns the registration lifecycle of one proxy.
///
/// The configuration is fixed for the wrapper's lifetime; a changed
/// configuration means a new wrapper.
pub struct ProxyWrapper {
    config: ProxyConfig,
    state: Mutex<WrapperState>,
    events: EventSender,
    cancel: CancellationToken,
}

impl ProxyWrapper {
    pub fn new(config: ProxyConfig, events: EventSender) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(WrapperState {
                phase: ProxyPhase::New,
                remote_addr: String::new(),
                error: String::new(),
                last_send_start: None,
                last_start_error: None,
            }),
            events,
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn phase(&self) -> ProxyPhase {
        self.state.lock().phase
    }

    pub fn status(&self) -> ProxyStatus {
        let state = self.state.lock();
        ProxyStatus {
            name: self.config.name.clone(),
            proxy_type: self.config.options.proxy_type(),
            phase: state.phase,
            local_addr: self.config.local_address(),
            remote_addr: state.remote_addr.clone(),
            error: state.error.clone(),
        }
    }

    /// Send the first registration and start supervising it
    pub fn start(self: &Arc<Self>) {
        self.check();
        tokio::spawn(Arc::clone(self).supervise());
    }

    async fn supervise(self: Arc<Self>) {
        let mut ticker = tokio::time::interval_at(Instant::now() + CHECK_INTERVAL, CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => self.check(),
            }
        }
    }

    /// Emit `NewProxy` when the phase calls for a (re)registration
    fn check(&self) {
        let now = Instant::now();
        {
            let mut state = self.state.lock();
            let resend = match state.phase {
                ProxyPhase::New => true,
                ProxyPhase::WaitStart => state
                    .last_send_start
                    .map_or(true, |t| now.duration_since(t) > WAIT_START_RESEND),
                ProxyPhase::StartError => state
                    .last_start_error
                    .map_or(true, |t| now.duration_since(t) > START_ERROR_RETRY),
                ProxyPhase::Running | ProxyPhase::Closed => false,
            };
            if !resend {
                return;
            }
            state.phase = ProxyPhase::WaitStart;
            state.last_send_start = Some(now);
        }

        tracing::debug!("Proxy [{}] sending registration", self.config.name);
        if self
            .events
            .send(ProxyEvent::Start(self.config.to_new_proxy()))
            .is_err()
        {
            tracing::debug!("Proxy [{}] event channel closed", self.config.name);
        }
    }

    /// Apply the server's answer to our registration
    pub fn set_running_status(&self, remote_addr: &str, server_error: &str) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        if state.phase != ProxyPhase::WaitStart {
            return Err(ClientError::InvalidPhase {
                name: self.config.name.clone(),
                phase: state.phase,
                expected: ProxyPhase::WaitStart,
            });
        }

        if server_error.is_empty() {
            state.phase = ProxyPhase::Running;
            state.remote_addr = remote_addr.to_string();
            state.error.clear();
            tracing::info!(
                "Proxy [{}] running, remote address [{}]",
                self.config.name,
                remote_addr
            );
        } else {
            state.phase = ProxyPhase::StartError;
            state.error = server_error.to_string();
            state.last_start_error = Some(Instant::now());
            tracing::warn!("Proxy [{}] start error: {}", self.config.name, server_error);
        }
        Ok(())
    }

    /// Stop supervising and withdraw the proxy from the server
    pub fn stop(&self) {
        self.cancel.cancel();
        {
            let mut state = self.state.lock();
            if state.phase == ProxyPhase::Closed {
                return;
            }
            state.phase = ProxyPhase::Closed;
        }

        let close = CloseProxy {
            proxy_name: self.config.name.clone(),
        };
        if self.events.send(ProxyEvent::Close(close)).is_err() {
            tracing::debug!("Proxy [{}] event channel closed", self.config.name);
        }
    }

    /// Serve a work connection if running; otherwise close it
    pub fn in_work_conn(&self, work_conn: BoxedStream, start: StartWorkConnection) {
        if self.phase() != ProxyPhase::Running {
            tracing::debug!(
                "Proxy [{}] is not running, closing work connection",
                self.config.name
            );
            return;
        }

        tokio::spawn(serve_work_conn(
            self.config.name.clone(),
            self.config.local_address(),
            work_conn,
            start,
        ));
    }
}

impl Drop for ProxyWrapper {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::event_channel;
    use hx_protocol::{ProxyOptions, TcpProxyOptions};

    fn config(name: &str) -> ProxyConfig {
        ProxyConfig {
            name: name.to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 8080,
            use_encryption: false,
            use_compression: false,
            options: ProxyOptions::Tcp(TcpProxyOptions { remote_port: 6000 }),
        }
    }

    #[tokio::test]
    async fn test_start_sends_registration() {
        let (tx, mut rx) = event_channel();
        let wrapper = ProxyWrapper::new(config("web"), tx);
        wrapper.start();

        assert_eq!(wrapper.phase(), ProxyPhase::WaitStart);
        match rx.try_recv().unwrap() {
            ProxyEvent::Start(m) => assert_eq!(m.proxy_name, "web"),
            other => panic!("expected Start, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_running_status_transitions() {
        let (tx, _rx) = event_channel();
        let wrapper = ProxyWrapper::new(config("web"), tx);

        // Not yet registered
        assert!(matches!(
            wrapper.set_running_status(":6000", ""),
            Err(ClientError::InvalidPhase { .. })
        ));

        wrapper.start();
        wrapper.set_running_status(":6000", "").unwrap();
        let status = wrapper.status();
        assert_eq!(status.phase, ProxyPhase::Running);
        assert_eq!(status.remote_addr, ":6000");
        assert_eq!(status.local_addr, "127.0.0.1:8080");
    }

    #[tokio::test]
    async fn test_start_error_recorded() {
        let (tx, _rx) = event_channel();
        let wrapper = ProxyWrapper::new(config("web"), tx);
        wrapper.start();

        wrapper.set_running_status("", "port already used").unwrap();
        let status = wrapper.status();
        assert_eq!(status.phase, ProxyPhase::StartError);
        assert_eq!(status.error, "port already used");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_registration_resent() {
        let (tx, mut rx) = event_channel();
        let wrapper = ProxyWrapper::new(config("web"), tx);
        wrapper.start();
        assert!(matches!(rx.try_recv(), Ok(ProxyEvent::Start(_))));

        tokio::time::advance(WAIT_START_RESEND + CHECK_INTERVAL).await;
        match rx.recv().await {
            Some(ProxyEvent::Start(m)) => assert_eq!(m.proxy_name, "web"),
            other => panic!("expected resent Start, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_error_retried_after_delay() {
        let (tx, mut rx) = event_channel();
        let wrapper = ProxyWrapper::new(config("web"), tx);
        wrapper.start();
        let _ = rx.try_recv();
        wrapper.set_running_status("", "denied").unwrap();

        tokio::time::advance(Duration::from_secs(10)).await;
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
        assert_eq!(wrapper.phase(), ProxyPhase::StartError);

        tokio::time::advance(START_ERROR_RETRY).await;
        assert!(matches!(rx.recv().await, Some(ProxyEvent::Start(_))));
        assert_eq!(wrapper.phase(), ProxyPhase::WaitStart);
    }

    #[tokio::test]
    async fn test_stop_emits_close_once() {
        let (tx, mut rx) = event_channel();
        let wrapper = ProxyWrapper::new(config("web"), tx);
        wrapper.start();
        let _ = rx.try_recv();

        wrapper.stop();
        wrapper.stop();
        assert!(matches!(rx.try_recv(), Ok(ProxyEvent::Close(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(wrapper.phase(), ProxyPhase::Closed);
    }
}
