//! Secret TCP proxy, reachable only through visitors

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hx_core::BoxedStream;
use hx_protocol::{ProxyType, StcpProxyOptions};

use super::{handle_user_connection, ServerProxy, WorkConnProvider};
use crate::error::ServerError;
use crate::visitor::VisitorManager;

/// Register with the visitor manager and bridge each visitor stream
pub fn start_stcp_proxy(
    provider: Weak<dyn WorkConnProvider>,
    name: &str,
    options: &StcpProxyOptions,
    owner_user: &str,
    visitors: Arc<VisitorManager>,
) -> Result<ServerProxy, ServerError> {
    let rx = visitors.listen(name, &options.secret_key, &options.allow_users, owner_user)?;

    let cancel = CancellationToken::new();
    let task = tokio::spawn(visitor_loop(rx, provider, name.to_string(), cancel.clone()));

    Ok(ServerProxy {
        name: name.to_string(),
        proxy_type: ProxyType::Stcp,
        remote_addr: String::new(),
        cancel,
        task,
        visitors: Some(visitors),
    })
}

async fn visitor_loop(
    mut rx: mpsc::Receiver<BoxedStream>,
    provider: Weak<dyn WorkConnProvider>,
    name: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            stream = rx.recv() => match stream {
                Some(stream) => {
                    tokio::spawn(handle_user_connection(
                        provider.clone(),
                        name.clone(),
                        stream,
                        None,
                        None,
                    ));
                }
                None => break,
            }
        }
    }
}
