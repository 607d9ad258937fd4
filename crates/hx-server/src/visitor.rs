//! Visitor routing for secret (`stcp`) proxies
//!
//! A visitor is another client that wants to reach a secret proxy. It dials
//! the server directly and proves knowledge of the proxy's secret key by
//! signing a recent timestamp with it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::mpsc;

use hx_core::auth::auth_key;
use hx_core::time::within_skew;
use hx_core::BoxedStream;

use crate::error::ServerError;

/// Maximum allowed difference between a visitor's timestamp and ours
pub const VISITOR_TIMESTAMP_SKEW: i64 = 10;

/// Pending visitor streams buffered per proxy
const VISITOR_QUEUE_CAPACITY: usize = 64;

struct VisitorListener {
    tx: mpsc::Sender<BoxedStream>,
    secret_key: String,
    allow_users: Vec<String>,
    owner_user: String,
}

impl VisitorListener {
    fn allows(&self, user: &str) -> bool {
        user == self.owner_user || self.allow_users.iter().any(|u| u == "*" || u == user)
    }
}

/// Routes authenticated visitor streams to the matching stcp proxy
#[derive(Default)]
pub struct VisitorManager {
    listeners: DashMap<String, VisitorListener>,
}

impl VisitorManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a secret proxy; visitor streams arrive on the returned receiver
    pub fn listen(
        &self,
        name: &str,
        secret_key: &str,
        allow_users: &[String],
        owner_user: &str,
    ) -> Result<mpsc::Receiver<BoxedStream>, ServerError> {
        match self.listeners.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ServerError::ProxyConflict(name.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(VISITOR_QUEUE_CAPACITY);
                slot.insert(VisitorListener {
                    tx,
                    secret_key: secret_key.to_string(),
                    allow_users: allow_users.to_vec(),
                    owner_user: owner_user.to_string(),
                });
                Ok(rx)
            }
        }
    }

    pub fn close_listener(&self, name: &str) {
        self.listeners.remove(name);
    }

    /// Authenticate a visitor and return where to deliver its stream.
    ///
    /// The caller answers the visitor before handing the stream over.
    pub fn authorize(
        &self,
        name: &str,
        sign_key: &str,
        timestamp: i64,
        visitor_user: &str,
    ) -> Result<mpsc::Sender<BoxedStream>, ServerError> {
        let listener = self
            .listeners
            .get(name)
            .ok_or_else(|| ServerError::VisitorAuth(format!("proxy [{}] not found", name)))?;

        if !within_skew(timestamp, VISITOR_TIMESTAMP_SKEW) {
            return Err(ServerError::VisitorAuth(format!(
                "timestamp for proxy [{}] is out of range",
                name
            )));
        }

        if auth_key(&listener.secret_key, timestamp) != sign_key {
            return Err(ServerError::VisitorAuth(format!(
                "invalid sign key for proxy [{}]",
                name
            )));
        }

        if !listener.allows(visitor_user) {
            return Err(ServerError::VisitorAuth(format!(
                "user [{}] is not allowed to visit proxy [{}]",
                visitor_user, name
            )));
        }

        Ok(listener.tx.clone())
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hx_core::time::unix_timestamp;

    fn manager_with(name: &str, allow_users: &[&str]) -> (VisitorManager, mpsc::Receiver<BoxedStream>) {
        let manager = VisitorManager::new();
        let allow: Vec<String> = allow_users.iter().map(|s| s.to_string()).collect();
        let rx = manager.listen(name, "s3cret", &allow, "alice").unwrap();
        (manager, rx)
    }

    #[tokio::test]
    async fn test_valid_visitor_delivered() {
        let (manager, mut rx) = manager_with("db", &[]);
        let now = unix_timestamp();
        let (stream, _peer) = tokio::io::duplex(64);

        let tx = manager
            .authorize("db", &auth_key("s3cret", now), now, "alice")
            .unwrap();
        tx.send(Box::new(stream)).await.unwrap();
        assert!(rx.recv().await.is_some());
    }

    #[test]
    fn test_bad_sign_key_rejected() {
        let (manager, _rx) = manager_with("db", &[]);
        let now = unix_timestamp();
        let result = manager.authorize("db", &auth_key("wrong", now), now, "alice");
        assert!(matches!(result, Err(ServerError::VisitorAuth(_))));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let (manager, _rx) = manager_with("db", &[]);
        let stale = unix_timestamp() - 60;
        let result = manager.authorize("db", &auth_key("s3cret", stale), stale, "alice");
        assert!(matches!(result, Err(ServerError::VisitorAuth(_))));
    }

    #[test]
    fn test_allow_users() {
        let now = unix_timestamp();
        let key = auth_key("s3cret", now);

        let (manager, _rx) = manager_with("db", &["bob"]);
        assert!(manager.authorize("db", &key, now, "bob").is_ok());
        assert!(manager.authorize("db", &key, now, "carol").is_err());

        let (manager, _rx) = manager_with("db", &["*"]);
        assert!(manager.authorize("db", &key, now, "carol").is_ok());
    }

    #[test]
    fn test_unknown_proxy_and_duplicate_listen() {
        let (manager, _rx) = manager_with("db", &[]);
        let now = unix_timestamp();
        assert!(manager
            .authorize("other", &auth_key("s3cret", now), now, "alice")
            .is_err());
        assert!(matches!(
            manager.listen("db", "x", &[], "bob"),
            Err(ServerError::ProxyConflict(_))
        ));

        manager.close_listener("db");
        assert!(manager.is_empty());
    }
}
