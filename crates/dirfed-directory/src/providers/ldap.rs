//! LDAP / Active Directory provider implementation
//!
//! This provider supports:
//! - User and group creation and lookup by name or sid
//! - Group membership through the configured member attribute (DNs)
//! - Foreign members mapped to local entries through a sid cross-reference attribute
//! - Active Directory's binary `objectSid`
//!
//! Requires the `ldap` feature to be enabled.

use async_trait::async_trait;
use ldap3::{
    dn_escape, ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Mod, Scope,
    SearchEntry,
};
use moka::future::Cache;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use dirfed_core::sid::{format_binary_sid, looks_like_windows_sid};
use dirfed_core::{
    classify_member, ensure_group_owner, DirectoryEntity, DirectoryError, DirectoryGroup,
    DirectoryProvider, DirectoryUser, ForeignEntityResolver, GroupCreationParams, Identity,
    LdapAttributeMappings, LdapConfig, LdapFlavor, MemberOrigin, ProviderId,
    Resolution, Result, Sid, UserCreationParams, UserSearchType,
};

use super::common::self_handle;

const NO_SUCH_OBJECT: u32 = 32;

/// Cached view of a group entry
#[derive(Debug, Clone)]
struct GroupEntry {
    dn: String,
    sid: Sid,
    name: String,
    description: String,
    members: Vec<String>,
}

impl GroupEntry {
    fn has_member(&self, dn: &str) -> bool {
        self.members.iter().any(|m| same_dn(m, dn))
    }
}

fn same_dn(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

/// LDAP / Active Directory directory provider
pub struct LdapProvider {
    config: LdapConfig,
    provider_id: ProviderId,
    mappings: LdapAttributeMappings,
    group_cache: Cache<Sid, Arc<GroupEntry>>,
    me: Weak<LdapProvider>,
}

impl LdapProvider {
    /// Create a new LDAP provider instance
    pub fn new(config: LdapConfig) -> Result<Arc<Self>> {
        if config.server_url.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Server URL must be specified"));
        }
        if config.base_dn.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Base DN must be specified"));
        }

        let provider_id = config.effective_provider_id();
        let mappings = config.effective_mappings();
        let group_cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(config.group_cache_ttl_secs))
            .build();

        info!(
            provider_id = %provider_id,
            "Initializing LDAP provider for {} ({:?})",
            config.server_url,
            config.flavor
        );

        Ok(Arc::new_cyclic(|me| Self {
            config,
            provider_id,
            mappings,
            group_cache,
            me: me.clone(),
        }))
    }

    async fn connect(&self) -> Result<Ldap> {
        let settings = LdapConnSettings::new().set_starttls(self.config.start_tls);

        let (conn, mut ldap) = LdapConnAsync::with_settings(settings, &self.config.server_url)
            .await
            .map_err(self.backend_err("LDAP connection failed"))?;

        let provider_id = self.provider_id.clone();
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(provider_id = %provider_id, "LDAP connection error: {}", e);
            }
        });

        // Bind with service account
        ldap.simple_bind(&self.config.bind_dn, &self.config.bind_password)
            .await
            .and_then(|r| r.success())
            .map_err(self.backend_err("LDAP bind failed"))?;

        Ok(ldap)
    }

    fn created_entry_err(&self, message: String) -> DirectoryError {
        DirectoryError::backend(self.provider_id.as_str(), message)
    }

    fn backend_err<'a>(
        &'a self,
        context: &'a str,
    ) -> impl FnOnce(LdapError) -> DirectoryError + 'a {
        move |e| DirectoryError::backend_with_source(self.provider_id.as_str(), context, e)
    }

    /// Attributes requested on every search. Operational sid attributes such as
    /// `entryUUID` are only returned when named.
    fn requested_attributes(&self) -> Vec<String> {
        let mut attrs = vec!["*".to_string(), self.mappings.sid.clone()];
        attrs.extend(self.config.foreign_sid_attributes.values().cloned());
        attrs
    }

    async fn search(
        &self,
        ldap: &mut Ldap,
        base: &str,
        scope: Scope,
        filter: &str,
    ) -> Result<Vec<SearchEntry>> {
        debug!("LDAP search base='{}' filter='{}'", base, filter);

        let result = ldap
            .search(base, scope, filter, self.requested_attributes())
            .await
            .map_err(self.backend_err("LDAP search failed"))?;

        if result.1.rc == NO_SUCH_OBJECT {
            return Ok(Vec::new());
        }
        result
            .1
            .success()
            .map_err(self.backend_err("LDAP search failed"))?;

        Ok(result.0.into_iter().map(SearchEntry::construct).collect())
    }

    async fn read_entry(&self, ldap: &mut Ldap, dn: &str) -> Result<Option<SearchEntry>> {
        Ok(self
            .search(ldap, dn, Scope::Base, "(objectClass=*)")
            .await?
            .into_iter()
            .next())
    }

    async fn search_one(
        &self,
        ldap: &mut Ldap,
        base: &str,
        filter: &str,
    ) -> Result<Option<SearchEntry>> {
        Ok(self
            .search(ldap, base, Scope::Subtree, filter)
            .await?
            .into_iter()
            .next())
    }

    fn class_filter(&self, class: &str) -> String {
        format!("({}={})", self.mappings.object_class, class)
    }

    fn user_class_filter(&self) -> String {
        self.class_filter(&self.mappings.user_object_class)
    }

    fn group_class_filter(&self) -> String {
        self.class_filter(&self.mappings.group_object_class)
    }

    /// Sid of an entry as exposed to the federation
    fn sid_of(&self, entry: &SearchEntry) -> Option<Sid> {
        match self.config.flavor {
            LdapFlavor::ActiveDirectory => {
                let bytes = binary_value(entry, &self.mappings.sid)?;
                format_binary_sid(&bytes).map(Sid::from)
            }
            LdapFlavor::Generic => {
                let raw = first_value(entry, &self.mappings.sid)?;
                if raw.starts_with(&self.config.sid_prefix) {
                    Some(Sid::from(raw))
                } else {
                    Some(Sid::from(format!("{}{}", self.config.sid_prefix, raw)))
                }
            }
        }
    }

    /// Sid attribute clause matching `sid`, or `None` when `sid` cannot be ours.
    ///
    /// Generic entries store either the prefixed sid we wrote or the bare
    /// server value, so both forms are searched.
    fn sid_filter(&self, sid: &Sid) -> Option<String> {
        if !self.supports_sid_lookup(sid) {
            return None;
        }
        let attr = &self.mappings.sid;
        match self.config.flavor {
            LdapFlavor::ActiveDirectory => {
                Some(format!("({}={})", attr, ldap_escape(sid.as_str())))
            }
            LdapFlavor::Generic => {
                let bare = sid.strip_prefix(&self.config.sid_prefix)?;
                Some(format!(
                    "(|({}={})({}={}))",
                    attr,
                    ldap_escape(sid.as_str()),
                    attr,
                    ldap_escape(bare)
                ))
            }
        }
    }

    fn is_group_entry(&self, entry: &SearchEntry) -> bool {
        values(entry, &self.mappings.object_class)
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.mappings.group_object_class))
    }

    fn user_from_entry(&self, entry: &SearchEntry) -> Option<DirectoryUser> {
        let sid = self.sid_of(entry)?;
        let username = first_value(entry, &self.mappings.username)
            .or_else(|| first_value(entry, &self.mappings.user_rdn))?;
        let display_name = first_value(entry, &self.mappings.display_name)
            .or_else(|| first_value(entry, &self.mappings.user_rdn))
            .unwrap_or_else(|| username.clone());
        let email = first_value(entry, &self.mappings.email).filter(|e| !e.is_empty());

        Some(
            DirectoryUser::new(sid, self.provider_id.clone(), username, display_name)
                .with_email(email)
                .with_distinguished_name(entry.dn.clone()),
        )
    }

    fn group_entry_from(&self, entry: &SearchEntry) -> Option<GroupEntry> {
        let sid = self.sid_of(entry)?;
        let name = first_value(entry, &self.mappings.group_name)
            .or_else(|| first_value(entry, &self.mappings.group_rdn))?;
        let description =
            first_value(entry, &self.mappings.group_description).unwrap_or_default();
        let members = values(entry, &self.mappings.group_member)
            .into_iter()
            .filter(|dn| !dn.trim().is_empty())
            .collect();

        Some(GroupEntry {
            dn: entry.dn.clone(),
            sid,
            name,
            description,
            members,
        })
    }

    fn group_value(&self, entry: &GroupEntry) -> Result<DirectoryGroup> {
        Ok(
            DirectoryGroup::new(entry.sid.clone(), entry.name.clone(), self_handle(&self.me)?)
                .with_description(entry.description.clone())
                .with_distinguished_name(entry.dn.clone()),
        )
    }

    async fn cache_group(&self, entry: &SearchEntry) -> Option<Arc<GroupEntry>> {
        let group = Arc::new(self.group_entry_from(entry)?);
        self.group_cache.insert(group.sid.clone(), group.clone()).await;
        Some(group)
    }

    /// Group entry by sid, served from cache when present
    async fn lookup_group(
        &self,
        ldap: &mut Ldap,
        sid: &Sid,
    ) -> Result<Option<Arc<GroupEntry>>> {
        if let Some(cached) = self.group_cache.get(sid).await {
            debug!("Found cached group with sid {}", sid);
            return Ok(Some(cached));
        }

        let Some(sid_clause) = self.sid_filter(sid) else {
            return Ok(None);
        };
        let filter = format!("(&{}{})", self.group_class_filter(), sid_clause);

        match self.search_one(ldap, &self.config.base_dn, &filter).await? {
            Some(entry) => Ok(self.cache_group(&entry).await),
            None => {
                debug!("Group not found with sid {}", sid);
                Ok(None)
            }
        }
    }

    async fn require_group(
        &self,
        ldap: &mut Ldap,
        group: &DirectoryGroup,
    ) -> Result<Arc<GroupEntry>> {
        self.lookup_group(ldap, group.sid())
            .await?
            .ok_or_else(|| DirectoryError::not_found("group", group.sid().as_str()))
    }

    async fn lookup_user_entry(
        &self,
        ldap: &mut Ldap,
        sid: &Sid,
    ) -> Result<Option<SearchEntry>> {
        let Some(sid_clause) = self.sid_filter(sid) else {
            return Ok(None);
        };
        let filter = format!("(&{}{})", self.user_class_filter(), sid_clause);
        self.search_one(ldap, &self.config.base_dn, &filter).await
    }

    /// DN of an entity owned by this provider
    async fn own_entity_dn(
        &self,
        ldap: &mut Ldap,
        entity: &DirectoryEntity,
    ) -> Result<Option<String>> {
        match entity {
            DirectoryEntity::User(user) => match &user.distinguished_name {
                Some(dn) => Ok(Some(dn.clone())),
                None => Ok(self
                    .lookup_user_entry(ldap, &user.sid)
                    .await?
                    .map(|entry| entry.dn)),
            },
            DirectoryEntity::Group(group) => Ok(self
                .lookup_group(ldap, group.sid())
                .await?
                .map(|entry| entry.dn.clone())),
        }
    }

    async fn map_foreign_dn(
        &self,
        ldap: &mut Ldap,
        entity: &DirectoryEntity,
    ) -> Result<Resolution<String>> {
        let Some(attribute) = self.config.foreign_sid_attributes.get(entity.provider_id()) else {
            return Ok(Resolution::unresolvable(format!(
                "no sid mapping for provider {}",
                entity.provider_id()
            )));
        };

        let filter = format!("({}={})", attribute, ldap_escape(entity.sid().as_str()));
        match self.search_one(ldap, &self.config.base_dn, &filter).await? {
            Some(entry) => {
                debug!("Mapped {} to {}", entity.key(), entry.dn);
                Ok(Resolution::Resolved(entry.dn))
            }
            None => Ok(Resolution::unresolvable(format!(
                "no entry with {}={}",
                attribute,
                entity.sid()
            ))),
        }
    }

    /// DN for `member`; own entities that no longer exist are `NotFound`
    async fn member_dn(
        &self,
        ldap: &mut Ldap,
        member: &DirectoryEntity,
        origin: MemberOrigin,
    ) -> Result<String> {
        match origin {
            MemberOrigin::Local => self.own_entity_dn(ldap, member).await?.ok_or_else(|| {
                DirectoryError::not_found(member.kind().to_string(), member.sid().as_str())
            }),
            MemberOrigin::Foreign => self
                .map_foreign_dn(ldap, member)
                .await?
                .require(&self.provider_id, member),
        }
    }

    async fn modify_members(
        &self,
        ldap: &mut Ldap,
        group: &GroupEntry,
        change: Mod<String>,
        context: &str,
    ) -> Result<()> {
        ldap.modify(&group.dn, vec![change])
            .await
            .and_then(|r| r.success())
            .map_err(self.backend_err(context))?;
        self.group_cache.invalidate(&group.sid).await;
        Ok(())
    }

    async fn add_entry(
        &self,
        ldap: &mut Ldap,
        dn: &str,
        attrs: HashMap<String, HashSet<String>>,
        context: &str,
    ) -> Result<()> {
        ldap.add(dn, attrs.into_iter().collect())
            .await
            .and_then(|r| r.success())
            .map_err(self.backend_err(context))?;
        Ok(())
    }

    fn user_attributes(
        &self,
        params: &UserCreationParams,
        sid: Option<&Sid>,
    ) -> HashMap<String, HashSet<String>> {
        let m = &self.mappings;
        let mut attrs = AttributeSet::default();

        let classes: &[&str] = match self.config.flavor {
            LdapFlavor::Generic => &["top", "person", "organizationalPerson", "inetOrgPerson"],
            LdapFlavor::ActiveDirectory => &["top", "person", "organizationalPerson", "user"],
        };
        for class in classes {
            attrs.add(&m.object_class, *class);
        }
        attrs.add(&m.object_class, &m.user_object_class);
        attrs.add(&m.user_rdn, &params.username);
        attrs.add(&m.username, &params.username);
        attrs.add(&m.display_name, params.effective_display_name());
        if self.config.flavor == LdapFlavor::Generic {
            // Fallback surname, required by person
            attrs.add("sn", &params.username);
        }
        if let Some(email) = params.email.as_deref().filter(|e| !e.trim().is_empty()) {
            attrs.add(&m.email, email);
        }
        if let Some(sid) = sid {
            attrs.add(&m.sid, sid.as_str());
        }
        attrs.0
    }

    fn group_attributes(
        &self,
        params: &GroupCreationParams,
        sid: Option<&Sid>,
    ) -> HashMap<String, HashSet<String>> {
        let m = &self.mappings;
        let mut attrs = AttributeSet::default();

        attrs.add(&m.object_class, "top");
        attrs.add(&m.object_class, &m.group_object_class);
        attrs.add(&m.group_rdn, &params.group_name);
        attrs.add(&m.group_name, &params.group_name);
        if let Some(description) = params.description.as_deref().filter(|d| !d.is_empty()) {
            attrs.add(&m.group_description, description);
        }
        match self.config.flavor {
            LdapFlavor::ActiveDirectory => attrs.add("sAMAccountName", &params.group_name),
            LdapFlavor::Generic => {
                // groupOfNames requires at least one member
                if m.group_object_class.eq_ignore_ascii_case("groupOfNames") {
                    attrs.add(&m.group_member, "");
                }
            }
        }
        if let Some(sid) = sid {
            attrs.add(&m.sid, sid.as_str());
        }
        attrs.0
    }

    /// Sid to write on creation, when this provider assigns them
    fn assigned_sid(&self) -> Option<Sid> {
        match self.config.flavor {
            LdapFlavor::Generic if self.config.assign_sids => {
                Some(Sid::generate(&self.config.sid_prefix))
            }
            _ => None,
        }
    }

    async fn create_user_on(
        &self,
        ldap: &mut Ldap,
        params: &UserCreationParams,
    ) -> Result<DirectoryUser> {
        if self.find_user_on(ldap, &params.username).await?.is_some() {
            warn!("User '{}' already exists", params.username);
            return Err(DirectoryError::already_exists("User", &params.username));
        }

        let dn = format!(
            "{}={},{}",
            self.mappings.user_rdn,
            dn_escape(&params.username),
            self.config.users_container()
        );
        if self.read_entry(ldap, &dn).await?.is_some() {
            warn!("User with DN '{}' already exists", dn);
            return Err(DirectoryError::already_exists("User", dn));
        }

        let sid = self.assigned_sid();
        let attrs = self.user_attributes(params, sid.as_ref());
        self.add_entry(ldap, &dn, attrs, "Failed to create user")
            .await?;

        let entry = self.read_entry(ldap, &dn).await?.ok_or_else(|| {
            self.created_entry_err(format!("Created user '{}' could not be read back", dn))
        })?;
        let user = self
            .user_from_entry(&entry)
            .ok_or_else(|| self.created_entry_err(format!("Created user '{}' has no sid", dn)))?;

        info!("Created user '{}' with DN {} and sid {}", user.username, dn, user.sid);
        Ok(user)
    }

    async fn create_group_on(
        &self,
        ldap: &mut Ldap,
        params: &GroupCreationParams,
    ) -> Result<DirectoryGroup> {
        if self.find_group_on(ldap, &params.group_name).await?.is_some() {
            warn!("Group '{}' already exists", params.group_name);
            return Err(DirectoryError::already_exists("Group", &params.group_name));
        }

        let dn = format!(
            "{}={},{}",
            self.mappings.group_rdn,
            dn_escape(&params.group_name),
            self.config.groups_container()
        );
        if self.read_entry(ldap, &dn).await?.is_some() {
            warn!("Group with DN '{}' already exists", dn);
            return Err(DirectoryError::already_exists("Group", dn));
        }

        let sid = self.assigned_sid();
        let attrs = self.group_attributes(params, sid.as_ref());
        self.add_entry(ldap, &dn, attrs, "Failed to create group")
            .await?;

        let entry = self.read_entry(ldap, &dn).await?.ok_or_else(|| {
            self.created_entry_err(format!("Created group '{}' could not be read back", dn))
        })?;
        let cached = self
            .cache_group(&entry)
            .await
            .ok_or_else(|| self.created_entry_err(format!("Created group '{}' has no sid", dn)))?;

        info!("Created group '{}' with DN {} and sid {}", cached.name, dn, cached.sid);
        self.group_value(&cached)
    }

    /// Matches the username attribute only; the RDN (often a full name) is
    /// checked by DN when creating.
    fn username_clause(&self, username: &str) -> String {
        format!("({}={})", self.mappings.username, ldap_escape(username))
    }

    async fn find_user_on(
        &self,
        ldap: &mut Ldap,
        username: &str,
    ) -> Result<Option<DirectoryUser>> {
        let filter = format!(
            "(&{}{}({}=*))",
            self.user_class_filter(),
            self.username_clause(username),
            self.mappings.sid
        );
        Ok(self
            .search_one(ldap, &self.config.base_dn, &filter)
            .await?
            .and_then(|entry| self.user_from_entry(&entry)))
    }

    async fn find_group_on(
        &self,
        ldap: &mut Ldap,
        group_name: &str,
    ) -> Result<Option<Arc<GroupEntry>>> {
        let name = ldap_escape(group_name);
        let filter = format!(
            "(&{}(|({}={})({}={}))({}=*))",
            self.group_class_filter(),
            self.mappings.group_name,
            name,
            self.mappings.group_rdn,
            name,
            self.mappings.sid
        );
        match self.search_one(ldap, &self.config.base_dn, &filter).await? {
            Some(entry) => Ok(self.cache_group(&entry).await),
            None => Ok(None),
        }
    }

    async fn search_users_on(
        &self,
        ldap: &mut Ldap,
        term: &str,
        search_type: UserSearchType,
    ) -> Result<Vec<DirectoryUser>> {
        let value = ldap_escape(term);
        let m = &self.mappings;
        let criteria = match search_type {
            UserSearchType::Username => self.username_clause(term),
            UserSearchType::DisplayName => format!("({}=*{}*)", m.display_name, value),
            UserSearchType::Email => format!("({}={})", m.email, value),
        };
        let filter = format!("(&{}{}({}=*))", self.user_class_filter(), criteria, m.sid);

        Ok(self
            .search(ldap, &self.config.base_dn, Scope::Subtree, &filter)
            .await?
            .iter()
            .filter_map(|entry| self.user_from_entry(entry))
            .collect())
    }

    async fn members_on(
        &self,
        ldap: &mut Ldap,
        group: &DirectoryGroup,
    ) -> Result<Vec<DirectoryEntity>> {
        let entry = self.require_group(ldap, group).await?;
        let mut members = Vec::with_capacity(entry.members.len());

        for dn in &entry.members {
            let found = match self.read_entry(ldap, dn).await {
                Ok(Some(found)) => found,
                Ok(None) => {
                    warn!("Skipping member '{}' of group '{}': entry not found", dn, entry.name);
                    continue;
                }
                Err(e) => {
                    warn!("Error processing group member with DN '{}': {}", dn, e);
                    continue;
                }
            };

            let member = if self.is_group_entry(&found) {
                match self.cache_group(&found).await {
                    Some(nested) => self.group_value(&nested).map(DirectoryEntity::Group).ok(),
                    None => None,
                }
            } else {
                self.user_from_entry(&found).map(DirectoryEntity::User)
            };

            match member {
                Some(member) => members.push(member),
                None => debug!("Skipping member '{}' without a usable sid", dn),
            }
        }

        Ok(members)
    }

    async fn add_member_on(
        &self,
        ldap: &mut Ldap,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
        origin: MemberOrigin,
    ) -> Result<()> {
        let entry = self.require_group(ldap, group).await?;
        let member_dn = self.member_dn(ldap, member, origin).await?;

        if entry.has_member(&member_dn) {
            warn!(
                "Member with DN '{}' is already a member of group with DN '{}'",
                member_dn, entry.dn
            );
            return Ok(());
        }

        let change = Mod::Add(
            self.mappings.group_member.clone(),
            HashSet::from([member_dn.clone()]),
        );
        self.modify_members(ldap, &entry, change, "Failed to add member to group")
            .await?;
        info!("Added member with DN '{}' to group '{}'", member_dn, entry.name);
        Ok(())
    }

    async fn remove_member_on(
        &self,
        ldap: &mut Ldap,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
        origin: MemberOrigin,
    ) -> Result<()> {
        let entry = self.require_group(ldap, group).await?;
        let member_dn = self.member_dn(ldap, member, origin).await?;

        let Some(stored) = entry.members.iter().find(|m| same_dn(m, &member_dn)) else {
            warn!(
                "Member with DN '{}' is not a member of group with DN '{}'",
                member_dn, entry.dn
            );
            return Ok(());
        };

        let change = Mod::Delete(
            self.mappings.group_member.clone(),
            HashSet::from([stored.clone()]),
        );
        self.modify_members(ldap, &entry, change, "Failed to remove member from group")
            .await?;
        info!("Removed member with DN '{}' from group '{}'", member_dn, entry.name);
        Ok(())
    }

    async fn is_direct_member_on(
        &self,
        ldap: &mut Ldap,
        group: &DirectoryGroup,
        entity: &DirectoryEntity,
    ) -> Result<bool> {
        let entry = self.require_group(ldap, group).await?;

        let dn = if entity.provider_id() == &self.provider_id {
            self.own_entity_dn(ldap, entity).await?
        } else if self.config.foreign_sid_attributes.contains_key(entity.provider_id()) {
            match self.map_foreign_dn(ldap, entity).await {
                Ok(resolution) => resolution.into_option(),
                Err(e) => {
                    warn!("Could not map {} for membership check: {}", entity.key(), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(dn.map(|dn| entry.has_member(&dn)).unwrap_or(false))
    }
}

#[derive(Default)]
struct AttributeSet(HashMap<String, HashSet<String>>);

impl AttributeSet {
    fn add(&mut self, attribute: &str, value: &str) {
        self.0
            .entry(attribute.to_string())
            .or_default()
            .insert(value.to_string());
    }
}

/// Attribute values, matching the attribute name without case
fn values(entry: &SearchEntry, attribute: &str) -> Vec<String> {
    entry
        .attrs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        .map(|(_, values)| values.clone())
        .unwrap_or_default()
}

fn first_value(entry: &SearchEntry, attribute: &str) -> Option<String> {
    values(entry, attribute).into_iter().next()
}

/// Raw bytes of an attribute that may have been returned as binary or text
fn binary_value(entry: &SearchEntry, attribute: &str) -> Option<Vec<u8>> {
    entry
        .bin_attrs
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(attribute))
        .and_then(|(_, values)| values.first().cloned())
        .or_else(|| first_value(entry, attribute).map(String::into_bytes))
}

#[async_trait]
impl ForeignEntityResolver for LdapProvider {
    type Reference = String;

    async fn resolve_foreign(&self, entity: &DirectoryEntity) -> Result<Resolution<String>> {
        if !self.config.foreign_sid_attributes.contains_key(entity.provider_id()) {
            return Ok(Resolution::unresolvable(format!(
                "no sid mapping for provider {}",
                entity.provider_id()
            )));
        }
        let mut ldap = self.connect().await?;
        let result = self.map_foreign_dn(&mut ldap, entity).await;
        ldap.unbind().await.ok();
        result
    }
}

#[async_trait]
impl DirectoryProvider for LdapProvider {
    fn provider_id(&self) -> &ProviderId {
        &self.provider_id
    }

    #[instrument(
        skip(self, params),
        fields(provider_id = %self.provider_id, username = %params.username)
    )]
    async fn create_user(&self, params: UserCreationParams) -> Result<DirectoryUser> {
        params.validate()?;
        info!("Creating user");

        let mut ldap = self.connect().await?;
        let result = self.create_user_on(&mut ldap, &params).await;
        ldap.unbind().await.ok();
        result
    }

    #[instrument(
        skip(self, params),
        fields(provider_id = %self.provider_id, group_name = %params.group_name)
    )]
    async fn create_group(&self, params: GroupCreationParams) -> Result<DirectoryGroup> {
        params.validate()?;
        info!("Creating group");

        let mut ldap = self.connect().await?;
        let result = self.create_group_on(&mut ldap, &params).await;
        ldap.unbind().await.ok();
        result
    }

    #[instrument(skip(self), fields(provider_id = %self.provider_id))]
    async fn find_user(&self, username: &str) -> Result<Option<DirectoryUser>> {
        if username.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Username cannot be empty"));
        }

        let mut ldap = self.connect().await?;
        let result = self.find_user_on(&mut ldap, username).await;
        ldap.unbind().await.ok();

        if let Ok(None) = &result {
            debug!("User not found with username: {}", username);
        }
        result
    }

    #[instrument(skip(self), fields(provider_id = %self.provider_id))]
    async fn find_group(&self, group_name: &str) -> Result<Option<DirectoryGroup>> {
        if group_name.trim().is_empty() {
            return Err(DirectoryError::invalid_input("Group name cannot be empty"));
        }

        let mut ldap = self.connect().await?;
        let result = self.find_group_on(&mut ldap, group_name).await;
        ldap.unbind().await.ok();

        match result? {
            Some(entry) => Ok(Some(self.group_value(&entry)?)),
            None => {
                debug!("Group not found with name: {}", group_name);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(provider_id = %self.provider_id))]
    async fn search_users(
        &self,
        term: &str,
        search_type: UserSearchType,
    ) -> Result<Vec<DirectoryUser>> {
        let mut ldap = self.connect().await?;
        let result = self.search_users_on(&mut ldap, term, search_type).await;
        ldap.unbind().await.ok();

        if let Ok(users) = &result {
            debug!("Search for '{}' matched {} users", term, users.len());
        }
        result
    }

    #[instrument(
        skip(self, group, member),
        fields(provider_id = %self.provider_id, group = %group.sid(), member = %member.key())
    )]
    async fn add_member_to_group(
        &self,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
    ) -> Result<()> {
        ensure_group_owner(&self.provider_id, group)?;
        let origin = classify_member(self, member).await?;

        let mut ldap = self.connect().await?;
        let result = self.add_member_on(&mut ldap, group, member, origin).await;
        ldap.unbind().await.ok();
        result
    }

    #[instrument(
        skip(self, group, member),
        fields(provider_id = %self.provider_id, group = %group.sid(), member = %member.key())
    )]
    async fn remove_member_from_group(
        &self,
        group: &DirectoryGroup,
        member: &DirectoryEntity,
    ) -> Result<()> {
        ensure_group_owner(&self.provider_id, group)?;
        let origin = classify_member(self, member).await?;

        let mut ldap = self.connect().await?;
        let result = self.remove_member_on(&mut ldap, group, member, origin).await;
        ldap.unbind().await.ok();
        result
    }

    #[instrument(
        skip(self, group),
        fields(provider_id = %self.provider_id, group = %group.sid())
    )]
    async fn get_group_members(&self, group: &DirectoryGroup) -> Result<Vec<DirectoryEntity>> {
        ensure_group_owner(&self.provider_id, group)?;

        let mut ldap = self.connect().await?;
        let result = self.members_on(&mut ldap, group).await;
        ldap.unbind().await.ok();

        if let Ok(members) = &result {
            debug!("Found {} members in group '{}'", members.len(), group.group_name());
        }
        result
    }

    async fn is_direct_member(
        &self,
        group: &DirectoryGroup,
        entity: &DirectoryEntity,
    ) -> Result<bool> {
        ensure_group_owner(&self.provider_id, group)?;

        let mut ldap = self.connect().await?;
        let result = self.is_direct_member_on(&mut ldap, group, entity).await;
        ldap.unbind().await.ok();
        result
    }

    /// Own entities, and foreign entities whose sid maps to a local entry
    async fn can_handle_foreign_entity(&self, entity: &DirectoryEntity) -> bool {
        if entity.provider_id() == &self.provider_id {
            return true;
        }
        match self.resolve_foreign(entity).await {
            Ok(resolution) => resolution.is_resolved(),
            Err(e) => {
                warn!("Error mapping foreign entity {} to DN: {}", entity.key(), e);
                false
            }
        }
    }

    fn supports_sid_lookup(&self, sid: &Sid) -> bool {
        match self.config.flavor {
            LdapFlavor::ActiveDirectory => looks_like_windows_sid(sid.as_str()),
            LdapFlavor::Generic => sid.has_prefix(&self.config.sid_prefix),
        }
    }

    #[instrument(skip(self), fields(provider_id = %self.provider_id))]
    async fn get_user_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryUser>> {
        if !self.supports_sid_lookup(sid) {
            return Ok(None);
        }

        let mut ldap = self.connect().await?;
        let result = self.lookup_user_entry(&mut ldap, sid).await;
        ldap.unbind().await.ok();

        Ok(result?.and_then(|entry| self.user_from_entry(&entry)))
    }

    #[instrument(skip(self), fields(provider_id = %self.provider_id))]
    async fn get_group_by_sid(&self, sid: &Sid) -> Result<Option<DirectoryGroup>> {
        if !self.supports_sid_lookup(sid) {
            return Ok(None);
        }
        if let Some(cached) = self.group_cache.get(sid).await {
            return Ok(Some(self.group_value(&cached)?));
        }

        let mut ldap = self.connect().await?;
        let result = self.lookup_group(&mut ldap, sid).await;
        ldap.unbind().await.ok();

        match result? {
            Some(entry) => Ok(Some(self.group_value(&entry)?)),
            None => Ok(None),
        }
    }
}
