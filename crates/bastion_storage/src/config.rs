//! In-memory configuration source.

use crate::error::{StoreError, StoreResult};
use crate::store::ConfigSource;
use async_trait::async_trait;
use bastion_core::{Client, ClientId, Policy, PolicyId, Repository, RepositoryId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Subject made ready by a successful preparation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReadyTarget {
    /// A client or hypervisor host
    Client(ClientId),
    /// A repository
    Repository(RepositoryId),
}

/// Configuration held in memory, loaded from the settings inventory
#[derive(Debug, Default)]
pub struct MemoryConfig {
    policies: RwLock<HashMap<PolicyId, Policy>>,
    clients: RwLock<HashMap<ClientId, Client>>,
    repositories: RwLock<HashMap<RepositoryId, Repository>>,
}

impl MemoryConfig {
    /// Create an empty configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from inventory lists
    #[must_use]
    pub fn from_inventory(
        policies: Vec<Policy>,
        clients: Vec<Client>,
        repositories: Vec<Repository>,
    ) -> Self {
        let config = Self::new();
        for policy in policies {
            config.add_policy(policy);
        }
        for client in clients {
            config.add_client(client);
        }
        for repository in repositories {
            config.add_repository(repository);
        }
        config
    }

    /// Add or replace a policy
    pub fn add_policy(&self, policy: Policy) {
        if let Ok(mut map) = self.policies.write() {
            map.insert(policy.id, policy);
        }
    }

    /// Add or replace a client
    pub fn add_client(&self, client: Client) {
        if let Ok(mut map) = self.clients.write() {
            map.insert(client.id, client);
        }
    }

    /// Add or replace a repository
    pub fn add_repository(&self, repository: Repository) {
        if let Ok(mut map) = self.repositories.write() {
            map.insert(repository.id, repository);
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Transient("configuration lock poisoned".to_string())
}

#[async_trait]
impl ConfigSource for MemoryConfig {
    async fn policy(&self, id: PolicyId) -> StoreResult<Policy> {
        let map = self.policies.read().map_err(|_| poisoned())?;
        map.get(&id).cloned().ok_or_else(|| StoreError::not_found("policy", id))
    }

    async fn client(&self, id: ClientId) -> StoreResult<Client> {
        let map = self.clients.read().map_err(|_| poisoned())?;
        map.get(&id).cloned().ok_or_else(|| StoreError::not_found("client", id))
    }

    async fn repository(&self, id: RepositoryId) -> StoreResult<Repository> {
        let map = self.repositories.read().map_err(|_| poisoned())?;
        map.get(&id)
            .cloned()
            .ok_or_else(|| StoreError::not_found("repository", id))
    }

    async fn mark_ready(&self, target: ReadyTarget) -> StoreResult<()> {
        match target {
            ReadyTarget::Client(id) => {
                let mut map = self.clients.write().map_err(|_| poisoned())?;
                let client = map
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::not_found("client", id))?;
                client.ready = true;
            }
            ReadyTarget::Repository(id) => {
                let mut map = self.repositories.write().map_err(|_| poisoned())?;
                let repository = map
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::not_found("repository", id))?;
                repository.ready = true;
            }
        }
        tracing::info!(?target, "marked ready");
        Ok(())
    }
}
