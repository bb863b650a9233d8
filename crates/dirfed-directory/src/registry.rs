//! Provider Registry - owns the registered providers and the directory service
//!
//! The registry provides:
//! - Provider registration, replacing by provider id
//! - Provider lookup by id
//! - A lazily built, cached `DirectoryService` rebuilt after registration
//! - A weak peer handle providers use to reach each other

use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use dirfed_core::{
    DirectoryError, DirectoryProvider, PeerDirectory, ProviderConfig, ProviderConfigDetails,
    ProviderId, ProviderSet, Result,
};

use crate::aggregator::DirectoryService;

#[cfg(feature = "json")]
use crate::providers::json::JsonFileProvider;

#[cfg(feature = "ldap")]
use crate::providers::ldap::LdapProvider;

/// Registry of directory providers
pub struct ProviderRegistry {
    /// Providers in registration order
    providers: Arc<RwLock<ProviderSet>>,

    /// Service built from the current provider set
    service: RwLock<Option<Arc<DirectoryService>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: Arc::new(RwLock::new(ProviderSet::new())),
            service: RwLock::new(None),
        }
    }

    /// Handle for providers that need to resolve entities owned by their peers
    pub fn peers(&self) -> PeerDirectory {
        PeerDirectory::new(&self.providers)
    }

    /// Register a provider, replacing any provider with the same id
    #[instrument(skip(self, provider), fields(provider_id = %provider.provider_id()))]
    pub async fn register(&self, provider: Arc<dyn DirectoryProvider>) -> Result<()> {
        if provider.provider_id().is_blank() {
            return Err(DirectoryError::invalid_input("Provider id cannot be empty"));
        }

        // Service lock first, then providers: `service()` takes them in the same order.
        let mut service = self.service.write().await;
        let replaced = self.providers.write().await.insert(provider);
        *service = None;

        if replaced.is_some() {
            info!("Replaced directory provider");
        } else {
            info!("Registered directory provider");
        }
        Ok(())
    }

    /// Build a provider from configuration and register it
    #[instrument(skip(self, config))]
    pub async fn register_config(&self, config: &ProviderConfig) -> Result<ProviderId> {
        match &config.details {
            #[cfg(feature = "json")]
            ProviderConfigDetails::JsonFile(json) => {
                let provider = JsonFileProvider::open(json.clone(), self.peers()).await?;
                let id = provider.provider_id().clone();
                self.register(provider).await?;
                Ok(id)
            }

            #[cfg(feature = "ldap")]
            ProviderConfigDetails::Ldap(ldap) => {
                let provider = LdapProvider::new(ldap.clone())?;
                let id = provider.provider_id().clone();
                self.register(provider).await?;
                Ok(id)
            }

            #[allow(unreachable_patterns)]
            other => {
                warn!("Provider type not enabled in this build: {:?}", other);
                Err(DirectoryError::unsupported(
                    "Provider type not enabled. Compile with the matching feature",
                ))
            }
        }
    }

    /// Get a provider by id
    pub async fn get_provider(&self, provider_id: &str) -> Result<Arc<dyn DirectoryProvider>> {
        if provider_id.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Provider id cannot be empty"));
        }

        self.providers
            .read()
            .await
            .get(provider_id)
            .ok_or_else(|| DirectoryError::not_found("provider", provider_id))
    }

    pub async fn has_provider(&self, provider_id: &str) -> bool {
        self.providers.read().await.contains(provider_id)
    }

    pub async fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers.read().await.ids()
    }

    /// Get count of registered providers
    pub async fn provider_count(&self) -> usize {
        self.providers.read().await.len()
    }

    /// The directory service over all registered providers, built on first
    /// use after each registration
    pub async fn service(&self) -> Result<Arc<DirectoryService>> {
        if let Some(service) = self.service.read().await.as_ref() {
            return Ok(service.clone());
        }

        let mut cached = self.service.write().await;
        if let Some(service) = cached.as_ref() {
            return Ok(service.clone());
        }

        let providers = self.providers.read().await.to_vec();
        if providers.is_empty() {
            return Err(DirectoryError::invalid_state(
                "No directory providers have been registered",
            ));
        }

        debug!("Building directory service over {} providers", providers.len());
        let service = Arc::new(DirectoryService::new(providers)?);
        *cached = Some(service.clone());
        Ok(service)
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
