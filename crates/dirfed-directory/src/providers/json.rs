//! JSON file provider
//!
//! Stores users and groups in a single JSON document. Every mutation is
//! applied to a copy of the document, written atomically (temp file and
//! rename), and only then made visible. Group member records reference
//! entities by `(sid, provider_id)`, so groups can hold members owned by
//! other providers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use dirfed_core::{
    classify_member, ensure_group_owner, DirectoryEntity, DirectoryError, DirectoryGroup,
    DirectoryProvider, DirectoryUser, EntityKey, EntityKind, ForeignEntityResolver,
    GroupCreationParams, Identity, JsonFileConfig, MemberOrigin, PeerDirectory, ProviderId,
    Resolution, Result, Sid, UserCreationParams, UserSearchType,
};

use super::common::{name_contains, names_match, self_handle};

// =============================================================================
// Document
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DirectoryDocument {
    #[serde(default)]
    users: Vec<StoredUser>,
    #[serde(default)]
    groups: Vec<StoredGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredUser {
    sid: Sid,
    username: String,
    display_name: String,
    #[serde(default)]
    email: Option<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredGroup {
    sid: Sid,
    group_name: String,
    #[serde(default)]
    description: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    members: Vec<MemberRecord>,
}

/// Reference to a group member, local or foreign
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub sid: Sid,
    pub provider_id: ProviderId,
    pub member_type: EntityKind,
}

impl MemberRecord {
    fn of(entity: &DirectoryEntity) -> Self {
        Self {
            sid: entity.sid().clone(),
            provider_id: entity.provider_id().clone(),
            member_type: entity.kind(),
        }
    }

    fn key(&self) -> EntityKey {
        EntityKey {
            sid: self.sid.clone(),
            provider_id: self.provider_id.clone(),
        }
    }

    fn refers_to(&self, other: &MemberRecord) -> bool {
        self.sid == other.sid && self.provider_id == other.provider_id
    }
}

impl DirectoryDocument {
    fn user(&self, sid: &Sid) -> Option<&StoredUser> {
        self.users.iter().find(|u| &u.sid == sid)
    }

    fn group(&self, sid: &Sid) -> Option<&StoredGroup> {
        self.groups.iter().find(|g| &g.sid == sid)
    }

    fn group_mut(&mut self, sid: &Sid) -> Option<&mut StoredGroup> {
        self.groups.iter_mut().find(|g| &g.sid == sid)
    }

    fn contains(&self, record: &MemberRecord) -> bool {
        match record.member_type {
            EntityKind::User => self.user(&record.sid).is_some(),
            EntityKind::Group => self.group(&record.sid).is_some(),
        }
    }
}

// =============================================================================
// Provider
// =============================================================================

/// Directory provider backed by a JSON file
pub struct JsonFileProvider {
    config: JsonFileConfig,
    document: RwLock<DirectoryDocument>,
    peers: PeerDirectory,
    me: Weak<JsonFileProvider>,
}

impl JsonFileProvider {
    /// Load the document at `config.file_path`, creating an empty one if missing
    #[instrument(skip(config, peers), fields(provider_id = %config.provider_id))]
    pub async fn open(config: JsonFileConfig, peers: PeerDirectory) -> Result<Arc<Self>> {
        if config.provider_id.is_blank() {
            return Err(DirectoryError::invalid_input("Provider id cannot be empty"));
        }

        let document = match load_document(&config).await? {
            Some(document) => {
                info!(
                    "Loaded {} users and {} groups from {}",
                    document.users.len(),
                    document.groups.len(),
                    config.file_path.display()
                );
                document
            }
            None => {
                info!(
                    "Creating new directory file at {}",
                    config.file_path.display()
                );
                let document = DirectoryDocument::default();
                write_document(&config, &document).await?;
                document
            }
        };

        Ok(Arc::new_cyclic(|me| Self {
            config,
            document: RwLock::new(document),
            peers,
            me: me.clone(),
        }))
    }

    pub fn file_path(&self) -> &Path {
        &self.config.file_path
    }

    fn user_value(&self, stored: &StoredUser) -> DirectoryUser {
        DirectoryUser::new(
            stored.sid.clone(),
            self.config.provider_id.clone(),
            stored.username.clone(),
            stored.display_name.clone(),
        )
        .with_email(stored.email.clone())
        .with_timestamps(Some(stored.created_at), stored.last_modified)
    }

    fn group_value(&self, stored: &StoredGroup) -> Result<DirectoryGroup> {
        Ok(
            DirectoryGroup::new(
                stored.sid.clone(),
                stored.group_name.clone(),
                self_handle(&self.me)?,
            )
            .with_description(stored.description.clone())
            .with_timestamps(Some(stored.created_at), stored.last_modified),
        )
    }

    /// Apply `change` to a copy of the document, persist it, then publish it.
    ///
    /// `change` returns its output and whether the document was modified;
    /// unmodified documents are not written.
    async fn mutate<T, F>(&self, change: F) -> Result<T>
    where
        F: FnOnce(&mut DirectoryDocument) -> Result<(T, bool)>,
    {
        let mut document = self.document.write().await;
        let mut draft = document.clone();
        let (output, modified) = change(&mut draft)?;
        if modified {
            write_document(&self.config, &draft).await?;
            *document = draft;
        }
        Ok(output)
    }

    /// Member record for `member`, or an unresolvable signal for foreign
    /// entities this provider cannot reference.
    async fn member_record(
        &self,
        member: &DirectoryEntity,
        origin: MemberOrigin,
    ) -> Result<Resolution<MemberRecord>> {
        match origin {
            MemberOrigin::Local => Ok(Resolution::Resolved(MemberRecord::of(member))),
            MemberOrigin::Foreign => self.resolve_foreign(member).await,
        }
    }

    async fn group_lists(&self, group: &Sid, record: &MemberRecord) -> bool {
        let document = self.document.read().await;
        document
            .group(group)
            .is_some_and(|stored| stored.members.iter().any(|m| m.refers_to(record)))
    }

    fn origin_of(&self, entity: &DirectoryEntity) -> MemberOrigin {
        if entity.provider_id() == &self.config.provider_id {
            MemberOrigin::Local
        } else {
            MemberOrigin::Foreign
        }
    }

    async fn materialize(&self, record: &MemberRecord) -> Result<Option<DirectoryEntity>> {
        if record.provider_id != self.config.provider_id {
            return self.peers.materialize(&record.key(), record.member_type).await;
        }

        let document = self.document.read().await;
        match record.member_type {
            EntityKind::User => Ok(document
                .user(&record.sid)
                .map(|u| DirectoryEntity::User(self.user_value(u)))),
            EntityKind::Group => match document.group(&record.sid) {
                Some(g) => Ok(Some(DirectoryEntity::Group(self.group_value(g)?))),
                None => Ok(None),
            },
        }
    }
}

#[async_trait]
impl ForeignEntityResolver for JsonFileProvider {
    type Reference = MemberRecord;

    async fn resolve_foreign(
        &self,
        entity: &DirectoryEntity,
    ) -> Result<Resolution<MemberRecord>> {
        if !self.config.foreign_entities.accepts(entity.provider_id()) {
            return Ok(Resolution::unresolvable(format!(
                "entities from provider {} are not accepted",
                entity.provider_id()
            )));
        }

        match self.peers.exists(&entity.key(), entity.kind()).await? {
            Some(false) => Ok(Resolution::unresolvable(format!(
                "{} no longer exists in provider {}",
                entity.sid(),
                entity.provider_id()
            ))),
            // Owner unregistered: the record is kept as given.
            Some(true) | None => Ok(Resolution::Resolved(MemberRecord::of(entity))),
        }
    }
}

#[async_trait]
impl DirectoryProvider for JsonFileProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.config.provider_id
    }

    #[instrument(
        skip(self, params),
        fields(provider_id = %self.config.provider_id, username = %params.username)
    )]
    async fn create_user(&self, params: UserCreationParams) -> Result<DirectoryUser> {
        params.validate()?;

        let sid = Sid::generate(&self.config.sid_prefix);
        let stored = self
            .mutate(|document| {
                if document
                    .users
                    .iter()
                    .any(|u| names_match(&u.username, &params.username))
                {
                    warn!("User '{}' already exists", params.username);
                    return Err(DirectoryError::already_exists("User", &params.username));
                }

                let stored = StoredUser {
                    sid,
                    username: params.username.clone(),
                    display_name: params.effective_display_name().to_string(),
                    email: params.email.clone(),
                    created_at: Utc::now(),
                    last_modified: None,
                };
                document.users.push(stored.clone());
                Ok((stored, true))
            })
            .await?;

        info!("Created user '{}' with sid {}", stored.username, stored.sid);
        Ok(self.user_value(&stored))
    }

    #[instrument(
        skip(self, params),
        fields(provider_id = %self.config.provider_id, group_name = %params.group_name)
    )]
    async fn create_group(&self, params: GroupCreationParams) -> Result<DirectoryGroup> {
        params.validate()?;

        let sid = Sid::generate(&self.config.sid_prefix);
        let stored = self
            .mutate(|document| {
                if document
                    .groups
                    .iter()
                    .any(|g| names_match(&g.group_name, &params.group_name))
                {
                    warn!("Group '{}' already exists", params.group_name);
                    return Err(DirectoryError::already_exists("Group", &params.group_name));
                }

                let stored = StoredGroup {
                    sid,
                    group_name: params.group_name.clone(),
                    description: params.description.clone().unwrap_or_default(),
                    created_at: Utc::now(),
                    last_modified: None,
                    members: Vec::new(),
                };
                document.groups.push(stored.clone());
                Ok((stored, true))
            })
            .await?;

        info!("Created group '{}' with sid {}", stored.group_name, stored.sid);
        self.group_value(&stored)
    }

    #[instrument(skip(self), fields(provider_id = %self.config.provider_id))]
    async fn find_user(&self, username: &str) -> Result<Option<DirectoryUser>> {
        let document = self.document.read().await;
        let user = document
            .users
            .iter()
            .find(|u| names_match(&u.username, username))
            .map(|u| self.user_value(u));

        if user.is_none() {
            debug!("User '{}' not found", username);
        }
        Ok(user)
    }

    #[instrument(skip(self), fields(provider_id = %self.config.provider_id))]
    async fn find_group(&self, group_name: &str) -> Result<Option<DirectoryGroup>> {
        let document = self.document.read().await;
        match document
            .groups
            .iter()
            .find(|g| names_match(&g.group_name, group_name))
        {
            Some(stored) => Ok(Some(self.group_value(stored)?)),
            None => {
                debug!("Group '{}' not found", group_name);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(provider_id = %self.config.provider_id))]
    async fn search_users(
        &self,
        term: &str,
        search_type: UserSearchType,
    ) -> Result<Vec<DirectoryUser>> {
        let document = self.document.read().await;
        let users: Vec<_> = document
            .users
            .iter()
            .filter(|u| match search_type {
                UserSearchType::Username => names_match(&u.username, term),
                UserSearchType::DisplayName => name_contains(&u.display_name, term),
                UserSearchType::Email => u
                    .email
                    .as_deref()
                    .map(|email| names_match(email, term))
                    .unwrap_or(false),
            })
            .map(|u| self.user_value(u))
            .collect();

        debug!("Search for '{}' matched {} users", term, users.len());
        Ok(users)
    }

    #[instrument(
        skip(self, group, member),
        fields(
            provider_id = %self.config.provider_id,
            group = %group.sid(),
            member = %member.key()
        )
    )]
    async fn add_member_to_group(
        &self,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
    ) -> Result<()> {
        ensure_group_owner(&self.config.provider_id, group)?;
        let origin = classify_member(self, member).await?;
        let record = self
            .member_record(member, origin)
            .await?
            .require(&self.config.provider_id, member)?;

        let added = self
            .mutate(|document| {
                if origin == MemberOrigin::Local && !document.contains(&record) {
                    return Err(DirectoryError::not_found(
                        record.member_type.to_string(),
                        record.sid.as_str(),
                    ));
                }

                let stored = document
                    .group_mut(group.sid())
                    .ok_or_else(|| DirectoryError::not_found("group", group.sid().as_str()))?;

                if stored.members.iter().any(|m| m.refers_to(&record)) {
                    return Ok((false, false));
                }

                stored.members.push(record.clone());
                stored.last_modified = Some(Utc::now());
                Ok((true, true))
            })
            .await?;

        if added {
            info!("Added {} to group '{}'", member, group.group_name());
        } else {
            warn!("{} is already a member of group '{}'", member, group.group_name());
        }
        Ok(())
    }

    #[instrument(
        skip(self, group, member),
        fields(
            provider_id = %self.config.provider_id,
            group = %group.sid(),
            member = %member.key()
        )
    )]
    async fn remove_member_from_group(
        &self,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
    ) -> Result<()> {
        ensure_group_owner(&self.config.provider_id, group)?;
        let origin = classify_member(self, member).await?;
        let record = match self.member_record(member, origin).await? {
            Resolution::Resolved(record) => record,
            unresolved => {
                // A record left behind by an entity its owner no longer knows
                let stored = MemberRecord::of(member);
                if !self.group_lists(group.sid(), &stored).await {
                    unresolved.require(&self.config.provider_id, member)?;
                }
                warn!(
                    "Removing unresolvable member {} from group '{}'",
                    member,
                    group.group_name()
                );
                stored
            }
        };

        let removed = self
            .mutate(|document| {
                let stored = document
                    .group_mut(group.sid())
                    .ok_or_else(|| DirectoryError::not_found("group", group.sid().as_str()))?;

                let before = stored.members.len();
                stored.members.retain(|m| !m.refers_to(&record));
                if stored.members.len() == before {
                    return Ok((false, false));
                }

                stored.last_modified = Some(Utc::now());
                Ok((true, true))
            })
            .await?;

        if removed {
            info!("Removed {} from group '{}'", member, group.group_name());
        } else {
            warn!("{} is not a member of group '{}'", member, group.group_name());
        }
        Ok(())
    }

    #[instrument(
        skip(self, group),
        fields(provider_id = %self.config.provider_id, group = %group.sid())
    )]
    async fn get_group_members(&self, group: &DirectoryGroup) -> Result<Vec<DirectoryEntity>> {
        ensure_group_owner(&self.config.provider_id, group)?;

        let records = {
            let document = self.document.read().await;
            document
                .group(group.sid())
                .map(|g| g.members.clone())
                .ok_or_else(|| DirectoryError::not_found("group", group.sid().as_str()))?
        };

        let mut members = Vec::with_capacity(records.len());
        for record in &records {
            match self.materialize(record).await {
                Ok(Some(entity)) => members.push(entity),
                Ok(None) => warn!(
                    "Skipping member {} of group '{}': entity not found",
                    record.key(),
                    group.group_name()
                ),
                Err(e) => warn!(
                    "Skipping member {} of group '{}': {}",
                    record.key(),
                    group.group_name(),
                    e
                ),
            }
        }

        debug!(
            "Found {} members in group '{}'",
            members.len(),
            group.group_name()
        );
        Ok(members)
    }

    async fn is_direct_member(
        &self,
        group: &DirectoryGroup,
        entity: &DirectoryEntity,
    ) -> Result<bool> {
        ensure_group_owner(&self.config.provider_id, group)?;

        let origin = self.origin_of(entity);
        if origin == MemberOrigin::Foreign && !self.can_handle_foreign_entity(entity).await {
            return Ok(false);
        }

        let record = match self.member_record(entity, origin).await {
            Ok(Resolution::Resolved(record)) => record,
            Ok(Resolution::Unresolvable { reason }) => {
                debug!("{} cannot be a member here: {}", entity.key(), reason);
                return Ok(false);
            }
            Err(e) => {
                warn!("Could not resolve {} for membership check: {}", entity.key(), e);
                return Ok(false);
            }
        };

        let document = self.document.read().await;
        let stored = document
            .group(group.sid())
            .ok_or_else(|| DirectoryError::not_found("group", group.sid().as_str()))?;
        Ok(stored.members.iter().any(|m| m.refers_to(&record)))
    }

    async fn can_handle_foreign_entity(&self, entity: &DirectoryEntity) -> bool {
        entity.provider_id() == &self.config.provider_id
            || self.config.foreign_entities.accepts(entity.provider_id())
    }

    fn supports_sid_lookup(&self, sid: &Sid) -> bool {
        sid.has_prefix(&self.config.sid_prefix)
    }

    #[instrument(skip(self), fields(provider_id = %self.config.provider_id))]
    async fn get_user_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryUser>> {
        let document = self.document.read().await;
        Ok(document.user(sid).map(|u| self.user_value(u)))
    }

    #[instrument(skip(self), fields(provider_id = %self.config.provider_id))]
    async fn get_group_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryGroup>> {
        let document = self.document.read().await;
        match document.group(sid) {
            Some(stored) => Ok(Some(self.group_value(stored)?)),
            None => Ok(None),
        }
    }
}

// =============================================================================
// Persistence
// =============================================================================

async fn load_document(config: &JsonFileConfig) -> Result<Option<DirectoryDocument>> {
    let path = &config.file_path;
    let provider_id = config.provider_id.as_str();

    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(DirectoryError::backend_with_source(
                provider_id,
                format!("Failed to read {}", path.display()),
                e,
            ))
        }
    };

    if contents.trim().is_empty() {
        return Ok(Some(DirectoryDocument::default()));
    }

    serde_json::from_str(&contents).map(Some).map_err(|e| {
        DirectoryError::backend_with_source(
            provider_id,
            format!("Failed to parse {}", path.display()),
            e,
        )
    })
}

async fn write_document(config: &JsonFileConfig, document: &DirectoryDocument) -> Result<()> {
    let path = &config.file_path;
    let provider_id = config.provider_id.as_str();

    let json = serde_json::to_vec_pretty(document).map_err(|e| {
        DirectoryError::backend_with_source(provider_id, "Failed to serialize directory", e)
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await.map_err(|e| {
            DirectoryError::backend_with_source(
                provider_id,
                format!("Failed to create {}", parent.display()),
                e,
            )
        })?;
    }

    let temp = temp_path(path);
    tokio::fs::write(&temp, &json).await.map_err(|e| {
        DirectoryError::backend_with_source(
            provider_id,
            format!("Failed to write {}", temp.display()),
            e,
        )
    })?;

    tokio::fs::rename(&temp, path).await.map_err(|e| {
        DirectoryError::backend_with_source(
            provider_id,
            format!("Failed to replace {}", path.display()),
            e,
        )
    })?;

    debug!("Saved directory to {}", path.display());
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}
