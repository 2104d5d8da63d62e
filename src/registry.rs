use dashmap::{mapref::entry::Entry, DashMap};

use crate::identity::ClientId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("brpc: client {0} already registered")]
    AlreadyRegistered(ClientId),
}

/// Live map from a connected peer's identity to its callback proxy.
///
/// Shard locks are only held for the duration of one map operation.
pub struct ClientRegistry<C> {
    clients: DashMap<ClientId, C>,
}

impl<C> std::fmt::Debug for ClientRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("len", &self.clients.len())
            .finish()
    }
}

impl<C: Clone> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clone> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn add(&self, id: ClientId, client: C) -> Result<(), RegistryError> {
        match self.clients.entry(id) {
            Entry::Occupied(_) => Err(RegistryError::AlreadyRegistered(id)),
            Entry::Vacant(v) => {
                v.insert(client);
                Ok(())
            }
        }
    }

    /// Removing an unknown id is a no-op.
    pub fn remove(&self, id: &ClientId) -> Option<C> {
        self.clients.remove(id).map(|(_, c)| c)
    }

    pub fn get(&self, id: &ClientId) -> Option<C> {
        self.clients.get(id).map(|c| c.value().clone())
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        let mut ids: Vec<_> = self.clients.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn duplicate_add_is_rejected() {
        let reg = ClientRegistry::new();
        let id = ClientId::new();
        reg.add(id, "first").unwrap();
        assert_eq!(
            reg.add(id, "second"),
            Err(RegistryError::AlreadyRegistered(id))
        );
        assert_eq!(reg.get(&id), Some("first"));
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = ClientRegistry::new();
        let id = ClientId::new();
        reg.add(id, 1u32).unwrap();
        assert_eq!(reg.remove(&id), Some(1));
        assert_eq!(reg.remove(&id), None);
        assert!(reg.get(&id).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn fetched_value_survives_removal() {
        let reg = ClientRegistry::new();
        let id = ClientId::new();
        reg.add(id, Arc::new(String::from("proxy"))).unwrap();
        let got = reg.get(&id).unwrap();
        reg.remove(&id);
        assert_eq!(got.as_str(), "proxy");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ops_on_distinct_ids_behave_like_a_map() {
        let reg = Arc::new(ClientRegistry::new());
        let mut tasks = Vec::new();
        for n in 0..64u32 {
            let reg = reg.clone();
            tasks.push(tokio::spawn(async move {
                let id = ClientId::new();
                reg.add(id, n).unwrap();
                tokio::task::yield_now().await;
                assert_eq!(reg.get(&id), Some(n));
                if n % 2 == 0 {
                    assert_eq!(reg.remove(&id), Some(n));
                    assert!(!reg.contains(&id));
                }
                id
            }));
        }

        let mut kept = Vec::new();
        for (n, t) in tasks.into_iter().enumerate() {
            let id = t.await.unwrap();
            if n % 2 == 1 {
                kept.push(id);
            }
        }
        kept.sort();
        assert_eq!(reg.len(), 32);
        assert_eq!(reg.ids(), kept);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_adds_of_one_id_admit_exactly_one() {
        for _ in 0..20 {
            let reg = Arc::new(ClientRegistry::new());
            let id = ClientId::new();
            let start = Arc::new(tokio::sync::Barrier::new(8));
            let mut tasks = Vec::new();
            for n in 0..8u32 {
                let (reg, start) = (reg.clone(), start.clone());
                tasks.push(tokio::spawn(async move {
                    start.wait().await;
                    reg.add(id, n).map(|()| n)
                }));
            }

            let mut winners = Vec::new();
            for t in tasks {
                match t.await.unwrap() {
                    Ok(n) => winners.push(n),
                    Err(err) => assert_eq!(err, RegistryError::AlreadyRegistered(id)),
                }
            }
            assert_eq!(winners.len(), 1);
            assert_eq!(reg.get(&id), Some(winners[0]));
            assert_eq!(reg.len(), 1);
        }
    }
}
