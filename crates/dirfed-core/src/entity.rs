//! Directory entity model: users, groups, and the tagged entity variant

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{DirectoryError, Result};
use crate::ids::{EntityKey, ProviderId, Sid};
use crate::provider::DirectoryProvider;

/// Anything that carries a federation-wide identity.
pub trait Identity {
    fn sid(&self) -> &Sid;
    fn provider_id(&self) -> &ProviderId;

    fn key(&self) -> EntityKey {
        EntityKey {
            sid: self.sid().clone(),
            provider_id: self.provider_id().clone(),
        }
    }
}

/// Whether an entity is a user or a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Group,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::User => write!(f, "user"),
            EntityKind::Group => write!(f, "group"),
        }
    }
}

// =============================================================================
// Users
// =============================================================================

/// Snapshot of a user as reported by its owning provider.
///
/// Equality and hashing use `(sid, provider_id)` only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub sid: Sid,
    pub provider_id: ProviderId,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub distinguished_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl DirectoryUser {
    pub fn new(
        sid: impl Into<Sid>,
        provider_id: impl Into<ProviderId>,
        username: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            sid: sid.into(),
            provider_id: provider_id.into(),
            username: username.into(),
            display_name: display_name.into(),
            email: None,
            distinguished_name: None,
            created_at: None,
            last_modified: None,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn with_distinguished_name(mut self, dn: impl Into<String>) -> Self {
        self.distinguished_name = Some(dn.into());
        self
    }

    pub fn with_timestamps(
        mut self,
        created_at: Option<DateTime<Utc>>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = created_at;
        self.last_modified = last_modified;
        self
    }
}

impl Identity for DirectoryUser {
    fn sid(&self) -> &Sid {
        &self.sid
    }

    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }
}

impl PartialEq for DirectoryUser {
    fn eq(&self, other: &Self) -> bool {
        self.sid == other.sid && self.provider_id == other.provider_id
    }
}

impl Eq for DirectoryUser {}

impl Hash for DirectoryUser {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sid.hash(state);
        self.provider_id.hash(state);
    }
}

// =============================================================================
// Groups
// =============================================================================

/// A group bound to the provider instance that owns it.
///
/// Membership operations on the group are delegated to that home provider,
/// so a group value obtained from any provider behaves the same way.
#[derive(Clone)]
pub struct DirectoryGroup {
    sid: Sid,
    provider_id: ProviderId,
    group_name: String,
    description: String,
    distinguished_name: Option<String>,
    created_at: Option<DateTime<Utc>>,
    last_modified: Option<DateTime<Utc>>,
    provider: Arc<dyn DirectoryProvider>,
}

impl DirectoryGroup {
    pub fn new(
        sid: impl Into<Sid>,
        group_name: impl Into<String>,
        provider: Arc<dyn DirectoryProvider>,
    ) -> Self {
        Self {
            sid: sid.into(),
            provider_id: provider.provider_id().clone(),
            group_name: group_name.into(),
            description: String::new(),
            distinguished_name: None,
            created_at: None,
            last_modified: None,
            provider,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_distinguished_name(mut self, dn: impl Into<String>) -> Self {
        self.distinguished_name = Some(dn.into());
        self
    }

    pub fn with_timestamps(
        mut self,
        created_at: Option<DateTime<Utc>>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Self {
        self.created_at = created_at;
        self.last_modified = last_modified;
        self
    }

    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn distinguished_name(&self) -> Option<&str> {
        self.distinguished_name.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.last_modified
    }

    pub fn home_provider(&self) -> &Arc<dyn DirectoryProvider> {
        &self.provider
    }

    pub async fn add_member(&self, member: &DirectoryEntity) -> Result<()> {
        self.provider.add_member_to_group(self, member).await
    }

    pub async fn remove_member(&self, member: &DirectoryEntity) -> Result<()> {
        self.provider.remove_member_from_group(self, member).await
    }

    /// Direct or nested membership.
    pub async fn is_member(&self, entity: &DirectoryEntity) -> Result<bool> {
        self.provider.is_group_member(self, entity).await
    }

    /// Direct members only.
    pub async fn get_members(&self) -> Result<Vec<DirectoryEntity>> {
        self.provider.get_group_members(self).await
    }
}

impl Identity for DirectoryGroup {
    fn sid(&self) -> &Sid {
        &self.sid
    }

    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }
}

impl fmt::Debug for DirectoryGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectoryGroup")
            .field("sid", &self.sid)
            .field("provider_id", &self.provider_id)
            .field("group_name", &self.group_name)
            .field("description", &self.description)
            .field("distinguished_name", &self.distinguished_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for DirectoryGroup {
    fn eq(&self, other: &Self) -> bool {
        self.sid == other.sid && self.provider_id == other.provider_id
    }
}

impl Eq for DirectoryGroup {}

impl Hash for DirectoryGroup {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sid.hash(state);
        self.provider_id.hash(state);
    }
}

// =============================================================================
// Tagged entity
// =============================================================================

/// A directory member: either a user or a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DirectoryEntity {
    User(DirectoryUser),
    Group(DirectoryGroup),
}

impl DirectoryEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            DirectoryEntity::User(_) => EntityKind::User,
            DirectoryEntity::Group(_) => EntityKind::Group,
        }
    }

    /// Username for users, group name for groups.
    pub fn name(&self) -> &str {
        match self {
            DirectoryEntity::User(u) => &u.username,
            DirectoryEntity::Group(g) => g.group_name(),
        }
    }

    pub fn as_user(&self) -> Option<&DirectoryUser> {
        match self {
            DirectoryEntity::User(u) => Some(u),
            DirectoryEntity::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&DirectoryGroup> {
        match self {
            DirectoryEntity::Group(g) => Some(g),
            DirectoryEntity::User(_) => None,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, DirectoryEntity::Group(_))
    }
}

impl Identity for DirectoryEntity {
    fn sid(&self) -> &Sid {
        match self {
            DirectoryEntity::User(u) => u.sid(),
            DirectoryEntity::Group(g) => g.sid(),
        }
    }

    fn provider_id(&self) -> &ProviderId {
        match self {
            DirectoryEntity::User(u) => u.provider_id(),
            DirectoryEntity::Group(g) => g.provider_id(),
        }
    }
}

impl From<DirectoryUser> for DirectoryEntity {
    fn from(user: DirectoryUser) -> Self {
        DirectoryEntity::User(user)
    }
}

impl From<DirectoryGroup> for DirectoryEntity {
    fn from(group: DirectoryGroup) -> Self {
        DirectoryEntity::Group(group)
    }
}

impl fmt::Display for DirectoryEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} '{}' ({}@{})",
            self.kind(),
            self.name(),
            self.sid(),
            self.provider_id()
        )
    }
}

// =============================================================================
// Creation parameters and search
// =============================================================================

/// Parameters for creating a user
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserCreationParams {
    pub username: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
}

impl UserCreationParams {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Default::default()
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Username cannot be empty"));
        }
        Ok(())
    }

    /// Display name, falling back to the username.
    pub fn effective_display_name(&self) -> &str {
        match self.display_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.username,
        }
    }
}

/// Parameters for creating a group
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupCreationParams {
    pub group_name: String,
    pub description: Option<String>,
}

impl GroupCreationParams {
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_name.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Group name cannot be empty"));
        }
        Ok(())
    }
}

/// How `search_users` interprets its term.
///
/// Every provider honours `Username`; providers without support for the
/// other modes fall back to a username lookup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserSearchType {
    #[default]
    Username,
    DisplayName,
    Email,
}

impl fmt::Display for UserSearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserSearchType::Username => write!(f, "username"),
            UserSearchType::DisplayName => write!(f, "display_name"),
            UserSearchType::Email => write!(f, "email"),
        }
    }
}

impl FromStr for UserSearchType {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "username" => Ok(UserSearchType::Username),
            "display_name" | "displayname" => Ok(UserSearchType::DisplayName),
            "email" => Ok(UserSearchType::Email),
            other => Err(DirectoryError::invalid_input(format!(
                "Unknown search type: {}",
                other
            ))),
        }
    }
}
