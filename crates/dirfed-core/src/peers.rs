//! Registered provider set and the weak peer handle providers use to reach each other

use std::sync::{Arc, Weak};

use tokio::sync::RwLock;
use tracing::debug;

use crate::entity::{DirectoryEntity, EntityKind};
use crate::error::Result;
use crate::ids::{EntityKey, ProviderId};
use crate::provider::DirectoryProvider;

/// Providers in registration order, unique by provider id.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn DirectoryProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `provider`, replacing one with the same id in its original slot.
    /// Returns the replaced provider.
    pub fn insert(
        &mut self,
        provider: Arc<dyn DirectoryProvider>,
    ) -> Option<Arc<dyn DirectoryProvider>> {
        match self
            .providers
            .iter()
            .position(|p| p.provider_id() == provider.provider_id())
        {
            Some(index) => Some(std::mem::replace(&mut self.providers[index], provider)),
            None => {
                self.providers.push(provider);
                None
            }
        }
    }

    pub fn get(&self, provider_id: &str) -> Option<Arc<dyn DirectoryProvider>> {
        self.providers
            .iter()
            .find(|p| p.provider_id().as_str() == provider_id)
            .cloned()
    }

    pub fn contains(&self, provider_id: &str) -> bool {
        self.providers
            .iter()
            .any(|p| p.provider_id().as_str() == provider_id)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn DirectoryProvider>> {
        self.providers.iter()
    }

    pub fn to_vec(&self) -> Vec<Arc<dyn DirectoryProvider>> {
        self.providers.clone()
    }

    pub fn ids(&self) -> Vec<ProviderId> {
        self.providers
            .iter()
            .map(|p| p.provider_id().clone())
            .collect()
    }
}

/// Weak view of the registered providers.
///
/// Providers hold one of these to materialize foreign members and to reach
/// the home provider of a foreign group. Holding it never keeps the registry
/// alive, and lookups go straight to the owning provider, never through the
/// aggregating service. A detached handle knows no peers.
#[derive(Clone, Default)]
pub struct PeerDirectory {
    providers: Weak<RwLock<ProviderSet>>,
}

impl PeerDirectory {
    pub fn new(providers: &Arc<RwLock<ProviderSet>>) -> Self {
        Self {
            providers: Arc::downgrade(providers),
        }
    }

    pub fn detached() -> Self {
        Self::default()
    }

    pub async fn provider(&self, provider_id: &ProviderId) -> Option<Arc<dyn DirectoryProvider>> {
        let providers = self.providers.upgrade()?;
        let set = providers.read().await;
        set.get(provider_id.as_str())
    }

    pub async fn is_registered(&self, provider_id: &ProviderId) -> bool {
        self.provider(provider_id).await.is_some()
    }

    /// Loads the current state of an entity from its owning provider.
    ///
    /// `Ok(None)` when the owner is not registered or no longer has the entity.
    pub async fn materialize(
        &self,
        key: &EntityKey,
        kind: EntityKind,
    ) -> Result<Option<DirectoryEntity>> {
        let Some(owner) = self.provider(&key.provider_id).await else {
            debug!("Owner of {} is not registered", key);
            return Ok(None);
        };

        let entity = match kind {
            EntityKind::User => owner
                .get_user_by_sid(&key.sid)
                .await?
                .map(DirectoryEntity::User),
            EntityKind::Group => owner
                .get_group_by_sid(&key.sid)
                .await?
                .map(DirectoryEntity::Group),
        };
        Ok(entity)
    }

    /// Whether the owning provider still reports the entity.
    ///
    /// `None` when the owner is not registered and existence cannot be checked.
    pub async fn exists(&self, key: &EntityKey, kind: EntityKind) -> Result<Option<bool>> {
        if !self.is_registered(&key.provider_id).await {
            return Ok(None);
        }
        Ok(Some(self.materialize(key, kind).await?.is_some()))
    }
}
