//! Server-wide proxy name ownership

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use hx_core::RunId;

use crate::error::ServerError;

/// Maps each registered proxy name to the run id of the session owning it.
///
/// Names are unique across all sessions on the server.
#[derive(Debug, Default)]
pub struct ProxyRegistry {
    owners: DashMap<String, RunId>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `name` for `owner`; fails if any session already holds it
    pub fn claim(&self, name: &str, owner: &RunId) -> Result<(), ServerError> {
        match self.owners.entry(name.to_string()) {
            Entry::Occupied(_) => Err(ServerError::ProxyConflict(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(owner.clone());
                Ok(())
            }
        }
    }

    /// Release `name` if `owner` holds it
    pub fn release(&self, name: &str, owner: &RunId) -> bool {
        self.owners.remove_if(name, |_, o| o == owner).is_some()
    }

    pub fn owner(&self, name: &str) -> Option<RunId> {
        self.owners.get(name).map(|o| o.clone())
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_conflict() {
        let registry = ProxyRegistry::new();
        let a = RunId::from("a");
        let b = RunId::from("b");

        registry.claim("ssh", &a).unwrap();
        assert!(matches!(
            registry.claim("ssh", &b),
            Err(ServerError::ProxyConflict(name)) if name == "ssh"
        ));
        assert_eq!(registry.owner("ssh"), Some(a));
    }

    #[test]
    fn test_release_only_by_owner() {
        let registry = ProxyRegistry::new();
        let a = RunId::from("a");
        let b = RunId::from("b");

        registry.claim("ssh", &a).unwrap();
        assert!(!registry.release("ssh", &b));
        assert!(registry.release("ssh", &a));
        assert!(registry.is_empty());
        registry.claim("ssh", &b).unwrap();
    }
}
