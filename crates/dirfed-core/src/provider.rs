//! The provider contract every directory backend implements

use async_trait::async_trait;
use tracing::warn;

use crate::entity::{
    DirectoryEntity, DirectoryGroup, DirectoryUser, GroupCreationParams, Identity,
    UserCreationParams, UserSearchType,
};
use crate::error::{DirectoryError, Result};
use crate::ids::{ProviderId, Sid};
use crate::membership;

/// A directory backend.
///
/// A provider owns all state and I/O for its backend. Groups it returns are
/// bound to it, and it decides unilaterally which foreign entities it accepts
/// as members.
#[async_trait]
pub trait DirectoryProvider: Send + Sync {
    /// Stable identifier, constant for the provider's lifetime.
    fn provider_id(&self) -> &ProviderId;

    async fn create_user(&self, params: UserCreationParams) -> Result<DirectoryUser>;

    async fn create_group(&self, params: GroupCreationParams) -> Result<DirectoryGroup>;

    async fn find_user(&self, username: &str) -> Result<Option<DirectoryUser>>;

    async fn find_group(&self, group_name: &str) -> Result<Option<DirectoryGroup>>;

    /// Search users. Providers that only support exact username lookup keep
    /// this default for every search type.
    async fn search_users(
        &self,
        term: &str,
        _search_type: UserSearchType,
    ) -> Result<Vec<DirectoryUser>> {
        Ok(self.find_user(term).await?.into_iter().collect())
    }

    async fn add_member_to_group(
        &self,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
    ) -> Result<()>;

    async fn remove_member_from_group(
        &self,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
    ) -> Result<()>;

    /// Direct members of `group`, materialized from their owners' current state.
    async fn get_group_members(&self, group: &DirectoryGroup) -> Result<Vec<DirectoryEntity>>;

    /// Whether this provider's store lists `entity` directly in `group`.
    /// Unresolvable foreign entities are reported as non-members.
    async fn is_direct_member(
        &self,
        group: &DirectoryGroup,
        entity: &DirectoryEntity,
    ) -> Result<bool>;

    /// Direct or nested membership, following group members across providers.
    async fn is_group_member(
        &self,
        group: &DirectoryGroup,
        entity: &DirectoryEntity,
    ) -> Result<bool> {
        ensure_group_owner(self.provider_id(), group)?;
        membership::is_member_nested(group, entity).await
    }

    /// Whether `entity` may become a member of this provider's groups.
    async fn can_handle_foreign_entity(&self, entity: &DirectoryEntity) -> bool {
        entity.provider_id() == self.provider_id()
    }

    /// Cheap syntactic check that `sid` could belong to this provider.
    fn supports_sid_lookup(&self, sid: &Sid) -> bool;

    async fn get_user_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryUser>>;

    async fn get_group_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryGroup>>;
}

/// Fails with `WrongProvider` unless `group` is owned by `provider_id`.
pub fn ensure_group_owner(provider_id: &ProviderId, group: &DirectoryGroup) -> Result<()> {
    if group.provider_id() != provider_id {
        warn!(
            provider_id = %provider_id,
            group_provider = %group.provider_id(),
            "Group '{}' is not owned by this provider",
            group.group_name()
        );
        return Err(DirectoryError::wrong_provider(
            provider_id.as_str(),
            group.provider_id().as_str(),
        ));
    }
    Ok(())
}

/// Where a prospective member lives relative to the group's provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOrigin {
    Local,
    Foreign,
}

/// Decides the add/remove path for `member`, failing with `Unsupported` when
/// `provider` refuses the member's provider.
pub async fn classify_member<P>(provider: &P, member: &DirectoryEntity) -> Result<MemberOrigin>
where
    P: DirectoryProvider + ?Sized,
{
    if member.provider_id() == provider.provider_id() {
        return Ok(MemberOrigin::Local);
    }

    if provider.can_handle_foreign_entity(member).await {
        Ok(MemberOrigin::Foreign)
    } else {
        warn!(
            provider_id = %provider.provider_id(),
            member_provider = %member.provider_id(),
            "Refusing foreign member {}",
            member.sid()
        );
        Err(DirectoryError::unsupported(format!(
            "Provider {} cannot handle entities from provider {}",
            provider.provider_id(),
            member.provider_id()
        )))
    }
}

/// Outcome of mapping a foreign entity into a provider's native form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<R> {
    Resolved(R),
    Unresolvable { reason: String },
}

impl<R> Resolution<R> {
    pub fn unresolvable(reason: impl Into<String>) -> Self {
        Resolution::Unresolvable {
            reason: reason.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, Resolution::Resolved(_))
    }

    pub fn into_option(self) -> Option<R> {
        match self {
            Resolution::Resolved(r) => Some(r),
            Resolution::Unresolvable { .. } => None,
        }
    }

    /// Turns an unresolvable entity into `ResolutionFailed`, for mutations.
    pub fn require(self, provider_id: &ProviderId, entity: &DirectoryEntity) -> Result<R> {
        match self {
            Resolution::Resolved(r) => Ok(r),
            Resolution::Unresolvable { reason } => {
                warn!(
                    provider_id = %provider_id,
                    member_provider = %entity.provider_id(),
                    "Could not resolve foreign entity {}: {}",
                    entity.sid(),
                    reason
                );
                Err(DirectoryError::resolution_failed(
                    provider_id.as_str(),
                    entity.provider_id().as_str(),
                    entity.sid().as_str(),
                    reason,
                ))
            }
        }
    }
}

/// Maps entities owned by other providers into this provider's storage form.
///
/// Implementations return either a complete native reference or a definite
/// `Unresolvable`; backend I/O failures are errors.
#[async_trait]
pub trait ForeignEntityResolver: Send + Sync {
    /// Native reference a member record is stored as (a DN, a member record, ...).
    type Reference: Send;

    async fn resolve_foreign(
        &self,
        entity: &DirectoryEntity,
    ) -> Result<Resolution<Self::Reference>>;
}
