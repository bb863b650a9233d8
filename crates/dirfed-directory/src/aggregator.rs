//! Directory Service - fans queries out across registered providers
//!
//! Every provider call runs in its own task. Successes are merged in
//! registration order; failures are wrapped with the provider id and only
//! surface when no provider produced a result.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use dirfed_core::{
    DirectoryError, DirectoryGroup, DirectoryProvider, DirectoryUser, ProviderId, ProviderSet,
    Result, Sid, UserSearchType,
};

/// Aggregated view over a fixed set of providers
pub struct DirectoryService {
    providers: Vec<Arc<dyn DirectoryProvider>>,
}

impl DirectoryService {
    /// Build a service over `providers`. A duplicate id replaces the earlier
    /// provider in its original position.
    pub fn new(providers: Vec<Arc<dyn DirectoryProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(DirectoryError::invalid_input(
                "At least one directory provider is required",
            ));
        }

        let mut set = ProviderSet::new();
        for provider in providers {
            if let Some(previous) = set.insert(provider) {
                debug!("Replaced duplicate provider {}", previous.provider_id());
            }
        }

        info!("Directory service created with {} providers", set.len());
        Ok(Self {
            providers: set.to_vec(),
        })
    }

    pub fn providers(&self) -> &[Arc<dyn DirectoryProvider>] {
        &self.providers
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        self.providers
            .iter()
            .map(|p| p.provider_id().clone())
            .collect()
    }

    /// Search all providers. Provider errors are tolerated as long as any
    /// provider returned a user.
    #[instrument(skip(self), fields(search_type = %search_type))]
    pub async fn search_users(
        &self,
        term: &str,
        search_type: UserSearchType,
    ) -> Result<Vec<DirectoryUser>> {
        if term.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Search term cannot be empty"));
        }

        debug!("Searching {} providers", self.providers.len());

        let handles = spawn_all(self.providers.iter(), |provider| {
            let term = term.to_string();
            async move { provider.search_users(&term, search_type).await }
        });

        let mut users = Vec::new();
        let mut errors = Vec::new();

        for (provider_id, handle) in handles {
            match join(&provider_id, handle).await {
                Ok(found) => {
                    debug!("Provider {} returned {} users", provider_id, found.len());
                    users.extend(found);
                }
                Err(e) => errors.push(DirectoryError::provider(
                    provider_id.as_str(),
                    format!("Error searching for users with term '{}'", term),
                    e,
                )),
            }
        }

        if users.is_empty() && !errors.is_empty() {
            warn!("All failing providers, no users found for '{}'", term);
            return Err(DirectoryError::aggregate(
                format!("Multiple providers failed while searching for users with term '{}'", term),
                errors,
            ));
        }

        for error in &errors {
            warn!("Ignoring provider failure during search: {}", error);
        }

        info!("Found {} users matching '{}'", users.len(), term);
        Ok(users)
    }

    /// Resolve a user by sid, asking only providers whose sid format matches.
    #[instrument(skip(self), fields(sid = %sid))]
    pub async fn get_user_by_id(&self, sid: &Sid) -> Result<DirectoryUser> {
        self.lookup_by_sid(sid, "user", |provider, sid| async move {
            provider.get_user_by_sid(&sid).await
        })
        .await
    }

    /// Resolve a group by sid, asking only providers whose sid format matches.
    #[instrument(skip(self), fields(sid = %sid))]
    pub async fn get_group_by_id(&self, sid: &Sid) -> Result<DirectoryGroup> {
        self.lookup_by_sid(sid, "group", |provider, sid| async move {
            provider.get_group_by_sid(&sid).await
        })
        .await
    }

    async fn lookup_by_sid<T, F, Fut>(&self, sid: &Sid, entity_type: &str, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: Fn(Arc<dyn DirectoryProvider>, Sid) -> Fut,
        Fut: std::future::Future<Output = Result<Option<T>>> + Send + 'static,
    {
        let candidates: Vec<_> = self
            .providers
            .iter()
            .filter(|p| p.supports_sid_lookup(sid))
            .collect();

        if candidates.is_empty() {
            warn!("No provider supports {} sid format", entity_type);
            return Err(DirectoryError::unsupported(format!(
                "No provider supports {} lookup by sid '{}'",
                entity_type, sid
            )));
        }

        debug!("Querying {} candidate providers", candidates.len());

        let mut handles = spawn_all(candidates.into_iter(), |provider| op(provider, sid.clone()))
            .into_iter();
        let mut errors = Vec::new();

        while let Some((provider_id, handle)) = handles.next() {
            match join(&provider_id, handle).await {
                Ok(Some(found)) => {
                    for (_, rest) in handles.by_ref() {
                        rest.abort();
                    }
                    for error in &errors {
                        warn!("Ignoring provider failure during lookup: {}", error);
                    }
                    debug!("Provider {} resolved {} {}", provider_id, entity_type, sid);
                    return Ok(found);
                }
                Ok(None) => {}
                Err(e) => errors.push(DirectoryError::provider(
                    provider_id.as_str(),
                    format!("Error getting {} by id '{}'", entity_type, sid),
                    e,
                )),
            }
        }

        if !errors.is_empty() {
            return Err(DirectoryError::aggregate(
                format!("Multiple providers failed while getting {} by id '{}'", entity_type, sid),
                errors,
            ));
        }

        debug!("{} {} not found in any provider", entity_type, sid);
        Err(DirectoryError::not_found(entity_type, sid.as_str()))
    }
}

fn spawn_all<'a, I, F, Fut, T>(providers: I, op: F) -> Vec<(ProviderId, JoinHandle<Result<T>>)>
where
    I: Iterator<Item = &'a Arc<dyn DirectoryProvider>>,
    F: Fn(Arc<dyn DirectoryProvider>) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    providers
        .map(|provider| {
            let provider_id = provider.provider_id().clone();
            (provider_id, tokio::spawn(op(provider.clone())))
        })
        .collect()
}

async fn join<T>(provider_id: &ProviderId, handle: JoinHandle<Result<T>>) -> Result<T> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(DirectoryError::backend_with_source(
            provider_id.as_str(),
            "Provider task failed",
            e,
        )),
    }
}
