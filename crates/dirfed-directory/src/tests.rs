//! Unit tests for dirfed-directory

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dirfed_core::{
    DirectoryEntity, DirectoryError, DirectoryGroup, DirectoryProvider, DirectoryUser,
    GroupCreationParams, ProviderId, Result, Sid, UserCreationParams, UserSearchType,
};

/// Provider with canned users that counts the calls it receives.
struct StubProvider {
    id: ProviderId,
    sid_prefix: String,
    users: Vec<DirectoryUser>,
    failure: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl StubProvider {
    fn new(id: &str, sid_prefix: &str) -> Self {
        Self {
            id: ProviderId::from(id),
            sid_prefix: sid_prefix.to_string(),
            users: Vec::new(),
            failure: None,
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    fn with_user(mut self, sid: &str, username: &str) -> Self {
        self.users.push(DirectoryUser::new(
            sid,
            self.id.clone(),
            username,
            username,
        ));
        self
    }

    fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(message) => Err(DirectoryError::backend(self.id.as_str(), message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DirectoryProvider for StubProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.id
    }

    async fn create_user(&self, _params: UserCreationParams) -> Result<DirectoryUser> {
        Err(DirectoryError::unsupported("read-only stub"))
    }

    async fn create_group(&self, _params: GroupCreationParams) -> Result<DirectoryGroup> {
        Err(DirectoryError::unsupported("read-only stub"))
    }

    async fn find_user(&self, username: &str) -> Result<Option<DirectoryUser>> {
        self.enter().await?;
        Ok(self.users.iter().find(|u| u.username == username).cloned())
    }

    async fn find_group(&self, _group_name: &str) -> Result<Option<DirectoryGroup>> {
        Ok(None)
    }

    async fn add_member_to_group(
        &self,
        _group: &DirectoryGroup,
        _member: &DirectoryEntity,
    ) -> Result<()> {
        Err(DirectoryError::unsupported("read-only stub"))
    }

    async fn remove_member_from_group(
        &self,
        _group: &DirectoryGroup,
        _member: &DirectoryEntity,
    ) -> Result<()> {
        Err(DirectoryError::unsupported("read-only stub"))
    }

    async fn get_group_members(&self, _group: &DirectoryGroup) -> Result<Vec<DirectoryEntity>> {
        Ok(Vec::new())
    }

    async fn is_direct_member(
        &self,
        _group: &DirectoryGroup,
        _entity: &DirectoryEntity,
    ) -> Result<bool> {
        Ok(false)
    }

    fn supports_sid_lookup(&self, sid: &Sid) -> bool {
        sid.has_prefix(&self.sid_prefix)
    }

    async fn get_user_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryUser>> {
        self.enter().await?;
        Ok(self.users.iter().find(|u| &u.sid == sid).cloned())
    }

    async fn get_group_by_sid(&self, _sid: &Sid) -> Result<Option<DirectoryGroup>> {
        self.enter().await?;
        Ok(None)
    }
}

// =============================================================================
// Provider Registry Tests
// =============================================================================

#[cfg(test)]
mod registry_tests {
    use super::*;
    use crate::registry::ProviderRegistry;

    #[tokio::test]
    async fn test_empty_registry_has_no_service() {
        let registry = ProviderRegistry::new();
        assert_eq!(registry.provider_count().await, 0);

        let err = registry.service().await.err().unwrap();
        assert!(matches!(err, DirectoryError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(StubProvider::new("A", "A-")))
            .await
            .unwrap();

        assert!(registry.has_provider("A").await);
        assert!(!registry.has_provider("B").await);
        assert_eq!(registry.get_provider("A").await.unwrap().provider_id(), "A");

        let err = registry.get_provider("B").await.err().unwrap();
        assert!(err.is_not_found());

        let err = registry.get_provider("  ").await.err().unwrap();
        assert!(matches!(err, DirectoryError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_blank_provider_id_rejected() {
        let registry = ProviderRegistry::new();
        let err = registry
            .register(Arc::new(StubProvider::new("", "X-")))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_service_cached_until_next_registration() {
        let registry = ProviderRegistry::new();
        registry
            .register(Arc::new(StubProvider::new("A", "A-")))
            .await
            .unwrap();

        let first = registry.service().await.unwrap();
        let again = registry.service().await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        registry
            .register(Arc::new(StubProvider::new("B", "B-")))
            .await
            .unwrap();
        let rebuilt = registry.service().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &rebuilt));
        assert_eq!(
            rebuilt.provider_ids(),
            vec![ProviderId::from("A"), ProviderId::from("B")]
        );
    }

    #[tokio::test]
    async fn test_replacement_keeps_registration_slot() {
        let registry = ProviderRegistry::new();
        for id in ["A", "B", "C"] {
            registry
                .register(Arc::new(StubProvider::new(id, "X-")))
                .await
                .unwrap();
        }

        let replacement = Arc::new(StubProvider::new("A", "X-").with_user("X-1", "new"));
        registry.register(replacement).await.unwrap();

        assert_eq!(registry.provider_count().await, 3);
        assert_eq!(
            registry.provider_ids().await,
            vec![
                ProviderId::from("A"),
                ProviderId::from("B"),
                ProviderId::from("C")
            ]
        );

        let user = registry
            .service()
            .await
            .unwrap()
            .get_user_by_id(&Sid::from("X-1"))
            .await
            .unwrap();
        assert_eq!(user.username, "new");
    }

    #[cfg(feature = "json")]
    #[tokio::test]
    async fn test_register_from_config() {
        use dirfed_core::{JsonFileConfig, ProviderConfig, ProviderConfigDetails};

        let dir = tempfile::tempdir().unwrap();
        let registry = ProviderRegistry::new();
        let config = ProviderConfig {
            enabled: true,
            details: ProviderConfigDetails::JsonFile(JsonFileConfig::new(
                dir.path().join("directory.json"),
            )),
        };

        let id = registry.register_config(&config).await.unwrap();
        assert_eq!(id, "JsonFile");
        assert!(registry.has_provider("JsonFile").await);
        assert!(dir.path().join("directory.json").exists());
    }
}

// =============================================================================
// Directory Service Tests
// =============================================================================

#[cfg(test)]
mod service_tests {
    use super::*;
    use crate::aggregator::DirectoryService;

    fn service(providers: Vec<Arc<StubProvider>>) -> DirectoryService {
        DirectoryService::new(
            providers
                .into_iter()
                .map(|p| p as Arc<dyn DirectoryProvider>)
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn test_requires_a_provider() {
        let err = DirectoryService::new(Vec::new()).err().unwrap();
        assert!(matches!(err, DirectoryError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_blank_search_term_rejected() {
        let svc = service(vec![Arc::new(StubProvider::new("A", "A-"))]);
        let err = svc
            .search_users("   ", UserSearchType::Username)
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_search_merges_in_registration_order() {
        let a = Arc::new(
            StubProvider::new("A", "A-")
                .with_user("A-1", "alice")
                .delayed(Duration::from_millis(30)),
        );
        let b = Arc::new(StubProvider::new("B", "B-").with_user("B-1", "alice"));
        let svc = service(vec![a.clone(), b.clone()]);

        let users = svc
            .search_users("alice", UserSearchType::Username)
            .await
            .unwrap();
        let owners: Vec<_> = users.iter().map(|u| u.provider_id.as_str()).collect();
        assert_eq!(owners, vec!["A", "B"]);
        assert_eq!(a.calls(), 1);
        assert_eq!(b.calls(), 1);
    }

    #[tokio::test]
    async fn test_search_partial_failure_returns_found_users() {
        let a = Arc::new(StubProvider::new("A", "A-").with_user("A-1", "alice"));
        let b = Arc::new(StubProvider::new("B", "B-").failing("connection refused"));
        let svc = service(vec![a, b]);

        let users = svc
            .search_users("alice", UserSearchType::Username)
            .await
            .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].provider_id, "A");
    }

    #[tokio::test]
    async fn test_search_total_failure_aggregates_every_provider() {
        let a = Arc::new(StubProvider::new("A", "A-").failing("ldap down"));
        let b = Arc::new(StubProvider::new("B", "B-").failing("file locked"));
        let svc = service(vec![a, b]);

        let err = svc
            .search_users("alice", UserSearchType::Username)
            .await
            .unwrap_err();
        assert_eq!(err.causes().len(), 2);

        let message = err.to_string();
        assert!(message.contains("Provider 'A'"));
        assert!(message.contains("Provider 'B'"));
        assert!(message.contains("ldap down"));
        assert!(message.contains("file locked"));
    }

    #[tokio::test]
    async fn test_search_single_failure_is_not_wrapped_in_aggregate() {
        let a = Arc::new(StubProvider::new("A", "A-"));
        let b = Arc::new(StubProvider::new("B", "B-").failing("timeout"));
        let svc = service(vec![a, b]);

        let err = svc
            .search_users("nobody", UserSearchType::Username)
            .await
            .unwrap_err();
        match err {
            DirectoryError::Provider {
                provider_id,
                message,
                ..
            } => {
                assert_eq!(provider_id, "B");
                assert_eq!(message, "Error searching for users with term 'nobody'");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_search_without_matches_or_errors_is_empty() {
        let svc = service(vec![Arc::new(StubProvider::new("A", "A-"))]);
        let users = svc
            .search_users("nobody", UserSearchType::Email)
            .await
            .unwrap();
        assert!(users.is_empty());
    }

    #[tokio::test]
    async fn test_sid_prefilter_skips_other_providers() {
        let json = Arc::new(StubProvider::new("JsonFile", "J-").with_user("J-1", "alice"));
        let ldap = Arc::new(StubProvider::new("LdapNet", "L-"));
        let ad = Arc::new(StubProvider::new("ActiveDirectory", "S-1-"));
        let svc = service(vec![json.clone(), ldap.clone(), ad.clone()]);

        let user = svc.get_user_by_id(&Sid::from("J-1")).await.unwrap();
        assert_eq!(user.username, "alice");
        assert_eq!(json.calls(), 1);
        assert_eq!(ldap.calls(), 0);
        assert_eq!(ad.calls(), 0);

        let err = svc.get_group_by_id(&Sid::from("J-missing")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(ldap.calls(), 0);
        assert_eq!(ad.calls(), 0);
    }

    #[tokio::test]
    async fn test_sid_without_candidate_is_unsupported() {
        let json = Arc::new(StubProvider::new("JsonFile", "J-"));
        let svc = service(vec![json.clone()]);

        let err = svc.get_user_by_id(&Sid::from("Z-1")).await.unwrap_err();
        assert!(err.is_unsupported());
        assert_eq!(json.calls(), 0);
    }

    #[tokio::test]
    async fn test_sid_lookup_prefers_registration_order() {
        let slow = Arc::new(
            StubProvider::new("First", "S-")
                .with_user("S-1", "from-first")
                .delayed(Duration::from_millis(30)),
        );
        let fast = Arc::new(StubProvider::new("Second", "S-").with_user("S-1", "from-second"));
        let svc = service(vec![slow, fast]);

        let user = svc.get_user_by_id(&Sid::from("S-1")).await.unwrap();
        assert_eq!(user.username, "from-first");
    }

    #[tokio::test]
    async fn test_sid_lookup_tolerates_failures_when_found() {
        let broken = Arc::new(StubProvider::new("Broken", "S-").failing("offline"));
        let healthy = Arc::new(StubProvider::new("Healthy", "S-").with_user("S-9", "bob"));
        let svc = service(vec![broken, healthy]);

        let user = svc.get_user_by_id(&Sid::from("S-9")).await.unwrap();
        assert_eq!(user.provider_id, "Healthy");
    }

    #[tokio::test]
    async fn test_sid_lookup_failures_without_result_surface() {
        let broken = Arc::new(StubProvider::new("Broken", "S-").failing("offline"));
        let empty = Arc::new(StubProvider::new("Empty", "S-"));
        let svc = service(vec![broken, empty]);

        let err = svc.get_user_by_id(&Sid::from("S-9")).await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(err.to_string().contains("Provider 'Broken'"));
        assert!(err.root().to_string().contains("offline"));
    }
}

// =============================================================================
// JSON File Provider Tests
// =============================================================================

#[cfg(all(test, feature = "json"))]
mod json_provider_tests {
    use super::*;
    use crate::providers::json::JsonFileProvider;
    use crate::registry::ProviderRegistry;
    use dirfed_core::{ForeignEntityPolicy, Identity, JsonFileConfig, PeerDirectory};
    use tempfile::TempDir;

    fn config(dir: &TempDir, id: &str, prefix: &str) -> JsonFileConfig {
        let mut config = JsonFileConfig::new(dir.path().join(format!("{}.json", id)));
        config.provider_id = ProviderId::from(id);
        config.sid_prefix = prefix.to_string();
        config
    }

    async fn standalone(dir: &TempDir) -> Arc<JsonFileProvider> {
        JsonFileProvider::open(config(dir, "JsonFile", "J-"), PeerDirectory::detached())
            .await
            .unwrap()
    }

    /// Two JSON providers registered together; `a` accepts `a_policy` foreign entities.
    async fn federation(
        dir: &TempDir,
        a_policy: ForeignEntityPolicy,
        b_policy: ForeignEntityPolicy,
    ) -> (ProviderRegistry, Arc<JsonFileProvider>, Arc<JsonFileProvider>) {
        let registry = ProviderRegistry::new();

        let mut a_config = config(dir, "A", "A-");
        a_config.foreign_entities = a_policy;
        let a = JsonFileProvider::open(a_config, registry.peers()).await.unwrap();

        let mut b_config = config(dir, "B", "B-");
        b_config.foreign_entities = b_policy;
        let b = JsonFileProvider::open(b_config, registry.peers()).await.unwrap();

        registry.register(a.clone()).await.unwrap();
        registry.register(b.clone()).await.unwrap();
        (registry, a, b)
    }

    async fn user(provider: &JsonFileProvider, name: &str) -> DirectoryEntity {
        provider
            .create_user(UserCreationParams::new(name))
            .await
            .unwrap()
            .into()
    }

    async fn group(provider: &JsonFileProvider, name: &str) -> DirectoryGroup {
        provider
            .create_group(GroupCreationParams::new(name))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_usernames_are_unique_ignoring_case() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;

        provider
            .create_user(UserCreationParams::new("alice"))
            .await
            .unwrap();
        let err = provider
            .create_user(UserCreationParams::new("ALICE"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        group(&provider, "Admins").await;
        let err = provider
            .create_group(GroupCreationParams::new("admins"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_blank_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;

        let err = provider
            .create_user(UserCreationParams::new(" "))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_created_user_defaults_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;

        let created = provider
            .create_user(UserCreationParams::new("bob").with_email("bob@example.com"))
            .await
            .unwrap();
        assert!(created.sid.has_prefix("J-"));
        assert_eq!(created.display_name, "bob");
        assert!(provider.supports_sid_lookup(&created.sid));

        let by_name = provider.find_user("BOB").await.unwrap().unwrap();
        let by_sid = provider.get_user_by_sid(&created.sid).await.unwrap().unwrap();
        assert_eq!(by_name, created);
        assert_eq!(by_sid.provider_id, created.provider_id);
        assert_eq!(by_sid.email.as_deref(), Some("bob@example.com"));
        assert!(by_sid.created_at.is_some());

        let g = provider
            .create_group(GroupCreationParams::new("ops"))
            .await
            .unwrap();
        assert_eq!(g.description(), "");
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let alice = user(&provider, "alice").await;
        let staff = group(&provider, "staff").await;
        staff.add_member(&alice).await.unwrap();
        drop(staff);
        drop(provider);

        let reopened = standalone(&dir).await;
        let staff = reopened.find_group("staff").await.unwrap().unwrap();
        assert!(staff.is_member(&alice).await.unwrap());
        assert!(!dir.path().join("JsonFile.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_a_backend_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("JsonFile.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = JsonFileProvider::open(JsonFileConfig::new(path), PeerDirectory::detached())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DirectoryError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_add_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let alice = user(&provider, "alice").await;
        let staff = group(&provider, "staff").await;

        staff.add_member(&alice).await.unwrap();
        staff.add_member(&alice).await.unwrap();

        assert!(staff.is_member(&alice).await.unwrap());
        let members = staff.get_members().await.unwrap();
        assert_eq!(members.iter().filter(|m| **m == alice).count(), 1);
    }

    #[tokio::test]
    async fn test_add_then_remove() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let alice = user(&provider, "alice").await;
        let staff = group(&provider, "staff").await;

        staff.add_member(&alice).await.unwrap();
        staff.remove_member(&alice).await.unwrap();

        assert!(!staff.is_member(&alice).await.unwrap());
        assert!(staff.get_members().await.unwrap().is_empty());

        // Removing again is a logged no-op
        staff.remove_member(&alice).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_local_member_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let staff = group(&provider, "staff").await;
        let ghost: DirectoryEntity =
            DirectoryUser::new("J-ghost", "JsonFile", "ghost", "ghost").into();

        let err = staff.add_member(&ghost).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_nested_membership() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let u = user(&provider, "u").await;
        let a = group(&provider, "A").await;
        let p = group(&provider, "P").await;

        a.add_member(&u).await.unwrap();
        p.add_member(&a.clone().into()).await.unwrap();

        assert!(p.is_member(&u).await.unwrap());
        assert!(!p.get_members().await.unwrap().contains(&u));
        assert!(p.get_members().await.unwrap()[0].is_group());
    }

    #[tokio::test]
    async fn test_membership_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let a = group(&provider, "A").await;
        let b = group(&provider, "B").await;
        a.add_member(&b.clone().into()).await.unwrap();
        b.add_member(&a.clone().into()).await.unwrap();

        let x = user(&provider, "x").await;
        assert!(!a.is_member(&x).await.unwrap());
        assert!(a.is_member(&b.clone().into()).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_from_other_provider_is_wrong_provider() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, a, b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;
        let b_group = group(&b, "b-team").await;
        let a_user = user(&a, "alice").await;

        let err = a.add_member_to_group(&b_group, &a_user).await.unwrap_err();
        assert!(err.is_wrong_provider());
        let err = a.get_group_members(&b_group).await.unwrap_err();
        assert!(err.is_wrong_provider());
    }

    #[tokio::test]
    async fn test_foreign_gating_is_unilateral() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, a, b) = federation(
            &dir,
            ForeignEntityPolicy::Only(vec![ProviderId::from("B")]),
            ForeignEntityPolicy::None,
        )
        .await;

        let a_user = user(&a, "alice").await;
        let b_user = user(&b, "bob").await;
        let a_group = group(&a, "a-team").await;
        let b_group = group(&b, "b-team").await;

        assert!(a.can_handle_foreign_entity(&b_user).await);
        assert!(!b.can_handle_foreign_entity(&a_user).await);

        a_group.add_member(&b_user).await.unwrap();
        assert!(a_group.is_member(&b_user).await.unwrap());

        let err = b_group.add_member(&a_user).await.unwrap_err();
        assert!(err.is_unsupported());
        assert!(!b_group.is_member(&a_user).await.unwrap());
    }

    #[tokio::test]
    async fn test_foreign_members_are_materialized_from_owner() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, a, b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;

        let bob = b
            .create_user(UserCreationParams::new("bob").with_display_name("Bob Builder"))
            .await
            .unwrap();
        let a_group = group(&a, "mixed").await;
        a_group.add_member(&bob.clone().into()).await.unwrap();

        let members = a_group.get_members().await.unwrap();
        assert_eq!(members.len(), 1);
        let member = members[0].as_user().unwrap();
        assert_eq!(member.provider_id, "B");
        assert_eq!(member.display_name, "Bob Builder");
    }

    #[tokio::test]
    async fn test_nested_group_on_other_provider() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, a, b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;

        let bob = user(&b, "bob").await;
        let b_team = group(&b, "b-team").await;
        b_team.add_member(&bob).await.unwrap();

        let everyone = group(&a, "everyone").await;
        everyone.add_member(&b_team.clone().into()).await.unwrap();

        assert!(everyone.is_member(&bob).await.unwrap());
        let nested = everyone.get_members().await.unwrap();
        let nested = nested[0].as_group().unwrap();
        assert_eq!(nested.provider_id(), "B");
        assert_eq!(nested.home_provider().provider_id(), "B");
    }

    #[tokio::test]
    async fn test_cross_provider_cycle_terminates() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, a, b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;

        let a_group = group(&a, "a").await;
        let b_group = group(&b, "b").await;
        a_group.add_member(&b_group.clone().into()).await.unwrap();
        b_group.add_member(&a_group.clone().into()).await.unwrap();

        let outsider = user(&a, "outsider").await;
        assert!(!a_group.is_member(&outsider).await.unwrap());
        assert!(!b_group.is_member(&outsider).await.unwrap());
    }

    #[tokio::test]
    async fn test_unresolvable_foreign_entity() {
        let dir = tempfile::tempdir().unwrap();
        let (_registry, a, _b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;
        let a_group = group(&a, "a-team").await;

        // Claims to be owned by B, but B has no such user
        let phantom: DirectoryEntity =
            DirectoryUser::new("B-missing", "B", "phantom", "phantom").into();
        assert!(a.can_handle_foreign_entity(&phantom).await);

        let err = a_group.add_member(&phantom).await.unwrap_err();
        assert!(err.is_resolution_failure());
        let err = a_group.remove_member(&phantom).await.unwrap_err();
        assert!(err.is_resolution_failure());
        assert!(!a_group.is_member(&phantom).await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_foreign_member_can_be_removed() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, a, b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;
        let a_group = group(&a, "a-team").await;
        let bob = user(&b, "bob").await;
        a_group.add_member(&bob).await.unwrap();

        // B comes back without bob, leaving bob's record in A dangling
        let mut emptied = config(&dir, "B", "B-");
        emptied.file_path = dir.path().join("B-empty.json");
        let emptied = JsonFileProvider::open(emptied, registry.peers()).await.unwrap();
        registry.register(emptied).await.unwrap();
        assert!(a_group.get_members().await.unwrap().is_empty());

        a_group.remove_member(&bob).await.unwrap();

        let restored = JsonFileProvider::open(config(&dir, "B", "B-"), registry.peers())
            .await
            .unwrap();
        registry.register(restored).await.unwrap();
        assert!(!a_group.is_member(&bob).await.unwrap());
        assert!(a_group.get_members().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;

        let mut same_name = Vec::new();
        let mut distinct = Vec::new();
        for i in 0..16 {
            let p = provider.clone();
            same_name.push(tokio::spawn(async move {
                p.create_user(UserCreationParams::new("racer")).await
            }));
            let p = provider.clone();
            distinct.push(tokio::spawn(async move {
                p.create_user(UserCreationParams::new(format!("racer-{}", i)))
                    .await
            }));
        }

        let mut created = 0;
        for task in same_name {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => assert!(e.is_already_exists()),
            }
        }
        assert_eq!(created, 1);
        for task in distinct {
            task.await.unwrap().unwrap();
        }

        drop(provider);
        let reopened = standalone(&dir).await;
        assert!(reopened.find_user("racer").await.unwrap().is_some());
        for i in 0..16 {
            let name = format!("racer-{}", i);
            assert!(reopened.find_user(&name).await.unwrap().is_some(), "{} lost", name);
        }
    }

    #[tokio::test]
    async fn test_members_from_unregistered_provider_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        let staff = group(&provider, "staff").await;
        let alice = user(&provider, "alice").await;

        // The owner is unknown to a detached provider, so the record is kept as given
        let outsider: DirectoryEntity = DirectoryUser::new("X-1", "Elsewhere", "x", "x").into();
        staff.add_member(&outsider).await.unwrap();
        staff.add_member(&alice).await.unwrap();

        assert!(staff.is_member(&outsider).await.unwrap());
        let members = staff.get_members().await.unwrap();
        assert_eq!(members, vec![alice]);
    }

    #[tokio::test]
    async fn test_search_types() {
        let dir = tempfile::tempdir().unwrap();
        let provider = standalone(&dir).await;
        provider
            .create_user(
                UserCreationParams::new("asmith")
                    .with_display_name("Alice Smith")
                    .with_email("alice@example.com"),
            )
            .await
            .unwrap();
        provider
            .create_user(UserCreationParams::new("bsmith").with_display_name("Bob Smith"))
            .await
            .unwrap();

        let by_name = provider
            .search_users("ASMITH", UserSearchType::Username)
            .await
            .unwrap();
        assert_eq!(by_name.len(), 1);

        let by_display = provider
            .search_users("smith", UserSearchType::DisplayName)
            .await
            .unwrap();
        assert_eq!(by_display.len(), 2);

        let by_email = provider
            .search_users("alice@example.com", UserSearchType::Email)
            .await
            .unwrap();
        assert_eq!(by_email[0].username, "asmith");
    }

    #[tokio::test]
    async fn test_aggregated_lookup_across_json_providers() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, a, b) =
            federation(&dir, ForeignEntityPolicy::Any, ForeignEntityPolicy::Any).await;
        let alice = a
            .create_user(UserCreationParams::new("pat"))
            .await
            .unwrap();
        b.create_user(UserCreationParams::new("pat")).await.unwrap();
        let team = group(&b, "team").await;

        let service = registry.service().await.unwrap();
        let found = service
            .search_users("pat", UserSearchType::Username)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        let by_id = service.get_user_by_id(&alice.sid).await.unwrap();
        assert_eq!(by_id.provider_id, "A");

        let by_id = service.get_group_by_id(team.sid()).await.unwrap();
        assert_eq!(by_id.group_name(), "team");
    }
}
