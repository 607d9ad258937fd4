//! Registry of control sessions by run id
//!
//! At most one session is registered per run id. Installing a session for a
//! run id that already has one supersedes the old session: the swap and the
//! old session's close request happen under the same write lock, so no
//! reader can observe two live sessions for one client.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use hx_core::RunId;

use super::ControlSession;

/// Control sessions indexed by run id
#[derive(Default)]
pub struct ControlManager {
    controls: RwLock<HashMap<RunId, Arc<ControlSession>>>,
}

impl ControlManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `session` for `run_id`.
    ///
    /// If another session was registered it is told to close before the lock
    /// is released and is returned; callers wait on its closed signal before
    /// starting the new session.
    pub async fn add(&self, run_id: RunId, session: Arc<ControlSession>) -> Option<Arc<ControlSession>> {
        let mut controls = self.controls.write().await;
        let old = controls.insert(run_id, session);
        if let Some(old) = &old {
            tracing::info!(run_id = %old.run_id(), "Superseding existing control session");
            old.close();
        }
        old
    }

    /// Remove `session` if it is still the one registered for `run_id`
    pub async fn del(&self, run_id: &RunId, session: &Arc<ControlSession>) -> bool {
        let mut controls = self.controls.write().await;
        match controls.get(run_id) {
            Some(current) if Arc::ptr_eq(current, session) => {
                controls.remove(run_id);
                true
            }
            _ => false,
        }
    }

    pub async fn get_by_id(&self, run_id: &RunId) -> Option<Arc<ControlSession>> {
        self.controls.read().await.get(run_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.controls.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.controls.read().await.is_empty()
    }

    /// Close and forget every session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<ControlSession>> = {
            let mut controls = self.controls.write().await;
            controls.drain().map(|(_, s)| s).collect()
        };
        for session in &sessions {
            session.close();
        }
        for session in sessions {
            session.wait_closed().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AlwaysPassVerifier;
    use crate::control::{SessionContext, SessionState};
    use crate::proxy::ProxyRegistry;
    use crate::visitor::VisitorManager;
    use hx_core::config::ServerConfig;
    use hx_protocol::Login;

    fn session(run_id: &str) -> Arc<ControlSession> {
        let ctx = SessionContext {
            config: Arc::new(ServerConfig::default()),
            registry: Arc::new(ProxyRegistry::new()),
            visitors: Arc::new(VisitorManager::new()),
        };
        ControlSession::new(
            RunId::from(run_id),
            Login::default(),
            Arc::new(AlwaysPassVerifier),
            0,
            ctx,
        )
    }

    #[tokio::test]
    async fn test_add_supersedes_and_closes_old() {
        let manager = ControlManager::new();
        let first = session("r1");
        let second = session("r1");

        assert!(manager.add(RunId::from("r1"), first.clone()).await.is_none());
        let old = manager.add(RunId::from("r1"), second.clone()).await.unwrap();

        assert!(Arc::ptr_eq(&old, &first));
        assert_eq!(first.state(), SessionState::Closed);
        assert_eq!(second.state(), SessionState::Pending);
        assert_eq!(manager.len().await, 1);
    }

    #[tokio::test]
    async fn test_del_only_removes_current_instance() {
        let manager = ControlManager::new();
        let first = session("r1");
        let second = session("r1");
        let run_id = RunId::from("r1");

        manager.add(run_id.clone(), first.clone()).await;
        manager.add(run_id.clone(), second.clone()).await;

        assert!(!manager.del(&run_id, &first).await);
        let current = manager.get_by_id(&run_id).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        assert!(manager.del(&run_id, &second).await);
        assert!(manager.is_empty().await);
    }

    #[tokio::test]
    async fn test_close_all() {
        let manager = ControlManager::new();
        let a = session("a");
        let b = session("b");
        manager.add(RunId::from("a"), a.clone()).await;
        manager.add(RunId::from("b"), b.clone()).await;

        manager.close_all().await;
        assert!(a.is_closed() && b.is_closed());
        assert!(manager.is_empty().await);
    }
}
