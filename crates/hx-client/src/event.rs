//! Proxy lifecycle events and their delivery to the server
//!
//! Proxy wrappers never touch the control stream. They emit events into a
//! channel and a single forwarding task, which owns the dispatcher handle,
//! turns them into messages.

use tokio::sync::mpsc;

use hx_protocol::{CloseProxy, DispatcherHandle, Message, NewProxy};

pub type EventSender = mpsc::UnboundedSender<ProxyEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProxyEvent>;

/// Something a proxy wrapper needs the server to know
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyEvent {
    /// Register (or re-register) the proxy
    Start(NewProxy),
    /// Withdraw the proxy
    Close(CloseProxy),
}

impl ProxyEvent {
    pub fn proxy_name(&self) -> &str {
        match self {
            ProxyEvent::Start(m) => &m.proxy_name,
            ProxyEvent::Close(m) => &m.proxy_name,
        }
    }
}

impl From<ProxyEvent> for Message {
    fn from(event: ProxyEvent) -> Self {
        match event {
            ProxyEvent::Start(m) => Message::NewProxy(m),
            ProxyEvent::Close(m) => Message::CloseProxy(m),
        }
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Forward events to the server until the channel or the dispatcher closes
pub async fn forward_events(mut rx: EventReceiver, handle: DispatcherHandle) {
    loop {
        let event = tokio::select! {
            _ = handle.closed() => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        tracing::debug!("Forwarding proxy event for [{}]", event.proxy_name());
        if let Err(e) = handle.send(event).await {
            tracing::debug!("Dropping proxy event: {}", e);
            break;
        }
    }
}
