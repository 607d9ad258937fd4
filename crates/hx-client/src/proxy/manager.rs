//! Reconciles running proxies against the desired configuration

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use hx_core::config::ProxyConfig;
use hx_core::BoxedStream;
use hx_protocol::StartWorkConnection;

use super::{ProxyStatus, ProxyWrapper};
use crate::error::ClientError;
use crate::event::EventSender;

/// Owns every proxy wrapper of one control connection
pub struct ProxyManager {
    proxies: RwLock<HashMap<String, Arc<ProxyWrapper>>>,
    events: EventSender,
}

impl ProxyManager {
    /// Create a manager whose wrappers report to `events`
    pub fn new(events: EventSender) -> Self {
        Self {
            proxies: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Bring the running set in line with `desired`.
    ///
    /// A proxy whose configuration changed in any field is stopped and
    /// recreated. The diff is computed under the write lock; wrappers are
    /// stopped and started after it is released.
    pub fn update_all(&self, desired: &[ProxyConfig]) {
        let (removed, added) = {
            let mut proxies = self.proxies.write();
            let wanted: HashMap<&str, &ProxyConfig> =
                desired.iter().map(|c| (c.name.as_str(), c)).collect();

            let mut removed = Vec::new();
            proxies.retain(|name, wrapper| {
                let keep = wanted
                    .get(name.as_str())
                    .is_some_and(|config| *config == wrapper.config());
                if !keep {
                    removed.push(Arc::clone(wrapper));
                }
                keep
            });

            let mut added = Vec::new();
            for config in desired {
                if proxies.contains_key(&config.name) {
                    continue;
                }
                let wrapper = ProxyWrapper::new(config.clone(), self.events.clone());
                proxies.insert(config.name.clone(), Arc::clone(&wrapper));
                added.push(wrapper);
            }

            (removed, added)
        };

        if !removed.is_empty() {
            for wrapper in &removed {
                wrapper.stop();
            }
            let names: Vec<&str> = removed.iter().map(|w| w.name()).collect();
            tracing::info!("proxy removed: {:?}", names);
        }

        if !added.is_empty() {
            for wrapper in &added {
                wrapper.start();
            }
            let names: Vec<&str> = added.iter().map(|w| w.name()).collect();
            tracing::info!("proxy added: {:?}", names);
        }
    }

    /// Record the server's answer to a proxy registration
    pub fn start_proxy(&self, name: &str, remote_addr: &str, server_error: &str) -> Result<(), ClientError> {
        let wrapper = self
            .get(name)
            .ok_or_else(|| ClientError::ProxyNotFound(name.to_string()))?;
        wrapper.set_running_status(remote_addr, server_error)
    }

    /// Route a work connection to its proxy; unknown names close the stream
    pub fn handle_work_connection(&self, name: &str, work_conn: BoxedStream, start: StartWorkConnection) {
        match self.get(name) {
            Some(wrapper) => wrapper.in_work_conn(work_conn, start),
            None => {
                tracing::warn!("Work connection for unknown proxy [{}], closing", name);
            }
        }
    }

    pub fn get_status(&self, name: &str) -> Option<ProxyStatus> {
        self.get(name).map(|w| w.status())
    }

    /// Status of every proxy, sorted by name
    pub fn get_all_status(&self) -> Vec<ProxyStatus> {
        let mut statuses: Vec<ProxyStatus> =
            self.proxies.read().values().map(|w| w.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Stop every proxy
    pub fn close(&self) {
        let wrappers: Vec<Arc<ProxyWrapper>> =
            self.proxies.write().drain().map(|(_, w)| w).collect();
        for wrapper in wrappers {
            wrapper.stop();
        }
    }

    pub fn len(&self) -> usize {
        self.proxies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.read().is_empty()
    }

    fn get(&self, name: &str) -> Option<Arc<ProxyWrapper>> {
        self.proxies.read().get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{event_channel, EventReceiver, ProxyEvent};
    use crate::proxy::ProxyPhase;
    use hx_protocol::{ProxyOptions, StcpProxyOptions, TcpProxyOptions};

    fn tcp(name: &str, remote_port: u16) -> ProxyConfig {
        ProxyConfig {
            name: name.to_string(),
            local_ip: "127.0.0.1".to_string(),
            local_port: 8000,
            use_encryption: false,
            use_compression: false,
            options: ProxyOptions::Tcp(TcpProxyOptions { remote_port }),
        }
    }

    fn drain(rx: &mut EventReceiver) -> Vec<ProxyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn summary(events: &[ProxyEvent]) -> Vec<String> {
        events
            .iter()
            .map(|e| match e {
                ProxyEvent::Start(m) => format!("start {}", m.proxy_name),
                ProxyEvent::Close(m) => format!("close {}", m.proxy_name),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_update_all_is_idempotent() {
        let (tx, mut rx) = event_channel();
        let manager = ProxyManager::new(tx);
        let desired = vec![tcp("a", 6001), tcp("b", 6002)];

        manager.update_all(&desired);
        assert_eq!(summary(&drain(&mut rx)), vec!["start a", "start b"]);

        manager.update_all(&desired);
        assert!(drain(&mut rx).is_empty());
        assert_eq!(manager.len(), 2);
    }

    #[tokio::test]
    async fn test_update_all_diff() {
        let (tx, mut rx) = event_channel();
        let manager = ProxyManager::new(tx);

        manager.update_all(&[tcp("a", 6001), tcp("b", 6002)]);
        drain(&mut rx);
        manager.start_proxy("b", ":6002", "").unwrap();

        manager.update_all(&[tcp("b", 6002), tcp("c", 6003)]);
        assert_eq!(summary(&drain(&mut rx)), vec!["close a", "start c"]);

        // b kept its state
        let b = manager.get_status("b").unwrap();
        assert_eq!(b.phase, ProxyPhase::Running);
        assert!(manager.get_status("a").is_none());
    }

    #[tokio::test]
    async fn test_changed_config_restarts_proxy() {
        let (tx, mut rx) = event_channel();
        let manager = ProxyManager::new(tx);

        manager.update_all(&[tcp("a", 6001)]);
        drain(&mut rx);

        manager.update_all(&[tcp("a", 7001)]);
        assert_eq!(summary(&drain(&mut rx)), vec!["close a", "start a"]);

        let stcp = ProxyConfig {
            options: ProxyOptions::Stcp(StcpProxyOptions {
                secret_key: "k".to_string(),
                allow_users: vec![],
            }),
            ..tcp("a", 0)
        };
        manager.update_all(&[stcp]);
        assert_eq!(summary(&drain(&mut rx)), vec!["close a", "start a"]);
    }

    #[tokio::test]
    async fn test_start_proxy_unknown_name() {
        let (tx, _rx) = event_channel();
        let manager = ProxyManager::new(tx);
        assert!(matches!(
            manager.start_proxy("ghost", ":1", ""),
            Err(ClientError::ProxyNotFound(name)) if name == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_work_connection_for_unknown_proxy_closed() {
        use tokio::io::AsyncReadExt;

        let (tx, _rx) = event_channel();
        let manager = ProxyManager::new(tx);
        let (work, mut peer) = tokio::io::duplex(64);

        manager.handle_work_connection("ghost", Box::new(work), StartWorkConnection::default());
        let mut buf = [0u8; 1];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_status_snapshot_and_close() {
        let (tx, mut rx) = event_channel();
        let manager = ProxyManager::new(tx);
        manager.update_all(&[tcp("z", 1), tcp("a", 2)]);
        manager.start_proxy("z", "", "denied").unwrap();

        let all = manager.get_all_status();
        let names: Vec<&str> = all.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "z"]);
        assert_eq!(all[1].phase, ProxyPhase::StartError);
        assert_eq!(all[1].error, "denied");

        drain(&mut rx);
        manager.close();
        assert!(manager.is_empty());
        assert_eq!(drain(&mut rx).len(), 2);
    }
}
