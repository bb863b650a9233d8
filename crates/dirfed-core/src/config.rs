//! Backend configuration types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::ids::ProviderId;

/// Configuration for one registered provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Skipped at startup when false
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(flatten)]
    pub details: ProviderConfigDetails,
}

fn default_true() -> bool {
    true
}

/// Backend-specific configuration details
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderConfigDetails {
    JsonFile(JsonFileConfig),
    Ldap(LdapConfig),
}

/// Which foreign providers' entities a provider accepts as group members
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForeignEntityPolicy {
    /// Any registered provider
    #[default]
    Any,
    /// Only the listed providers
    Only(Vec<ProviderId>),
    /// Own entities only
    None,
}

impl ForeignEntityPolicy {
    pub fn accepts(&self, provider_id: &ProviderId) -> bool {
        match self {
            ForeignEntityPolicy::Any => true,
            ForeignEntityPolicy::Only(ids) => ids.contains(provider_id),
            ForeignEntityPolicy::None => false,
        }
    }
}

/// JSON file store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonFileConfig {
    /// Path to the JSON document; created when missing
    pub file_path: PathBuf,
    #[serde(default = "default_json_provider_id")]
    pub provider_id: ProviderId,
    /// Prefix of generated sids
    #[serde(default = "default_json_sid_prefix")]
    pub sid_prefix: String,
    #[serde(default)]
    pub foreign_entities: ForeignEntityPolicy,
}

fn default_json_provider_id() -> ProviderId {
    ProviderId::from("JsonFile")
}

fn default_json_sid_prefix() -> String {
    "J-".to_string()
}

impl JsonFileConfig {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            provider_id: default_json_provider_id(),
            sid_prefix: default_json_sid_prefix(),
            foreign_entities: ForeignEntityPolicy::default(),
        }
    }
}

/// Directory schema flavor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LdapFlavor {
    /// inetOrgPerson / groupOfNames directories
    #[default]
    Generic,
    /// Active Directory: binary objectSid, sAMAccountName
    ActiveDirectory,
}

/// LDAP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapConfig {
    /// LDAP server URL (e.g., "ldap://ldap.company.com:389")
    pub server_url: String,
    /// Bind DN
    pub bind_dn: String,
    /// Bind password
    #[serde(skip_serializing, default)]
    pub bind_password: String,
    /// Base DN for searches
    pub base_dn: String,
    /// Container for new users; defaults to the base DN
    #[serde(default)]
    pub users_dn: Option<String>,
    /// Container for new groups; defaults to the base DN
    #[serde(default)]
    pub groups_dn: Option<String>,
    /// Use StartTLS
    #[serde(default)]
    pub start_tls: bool,
    #[serde(default)]
    pub flavor: LdapFlavor,
    /// Overrides the flavor's provider id
    #[serde(default)]
    pub provider_id: Option<ProviderId>,
    /// Prefix identifying this provider's sids (generic flavor)
    #[serde(default = "default_ldap_sid_prefix")]
    pub sid_prefix: String,
    /// Write a generated sid into the sid attribute on creation (generic flavor).
    /// Values read back without `sid_prefix` are prefixed either way.
    #[serde(default = "default_true")]
    pub assign_sids: bool,
    /// Attribute mappings; the flavor's preset when omitted
    #[serde(default)]
    pub attribute_mappings: Option<LdapAttributeMappings>,
    /// Foreign provider id -> attribute holding that provider's sid on local entries
    #[serde(default)]
    pub foreign_sid_attributes: HashMap<ProviderId, String>,
    /// Group entry cache lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub group_cache_ttl_secs: u64,
}

fn default_ldap_sid_prefix() -> String {
    "L-".to_string()
}

fn default_cache_ttl() -> u64 {
    300
}

impl LdapConfig {
    pub fn effective_provider_id(&self) -> ProviderId {
        match (&self.provider_id, self.flavor) {
            (Some(id), _) => id.clone(),
            (None, LdapFlavor::Generic) => ProviderId::from("LdapNet"),
            (None, LdapFlavor::ActiveDirectory) => ProviderId::from("ActiveDirectory"),
        }
    }

    pub fn effective_mappings(&self) -> LdapAttributeMappings {
        match (&self.attribute_mappings, self.flavor) {
            (Some(m), _) => m.clone(),
            (None, LdapFlavor::Generic) => LdapAttributeMappings::default(),
            (None, LdapFlavor::ActiveDirectory) => LdapAttributeMappings::active_directory(),
        }
    }

    pub fn users_container(&self) -> &str {
        self.users_dn.as_deref().unwrap_or(&self.base_dn)
    }

    pub fn groups_container(&self) -> &str {
        self.groups_dn.as_deref().unwrap_or(&self.base_dn)
    }
}

/// LDAP attribute mappings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapAttributeMappings {
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub sid: String,
    pub group_name: String,
    pub group_description: String,
    pub group_member: String,
    pub object_class: String,
    pub user_object_class: String,
    pub group_object_class: String,
    /// RDN attribute of new user entries
    pub user_rdn: String,
    /// RDN attribute of new group entries
    pub group_rdn: String,
}

impl Default for LdapAttributeMappings {
    fn default() -> Self {
        Self {
            username: "uid".to_string(),
            display_name: "displayName".to_string(),
            email: "mail".to_string(),
            sid: "entryUUID".to_string(),
            group_name: "cn".to_string(),
            group_description: "description".to_string(),
            group_member: "member".to_string(),
            object_class: "objectClass".to_string(),
            user_object_class: "person".to_string(),
            group_object_class: "groupOfNames".to_string(),
            user_rdn: "cn".to_string(),
            group_rdn: "cn".to_string(),
        }
    }
}

impl LdapAttributeMappings {
    pub fn active_directory() -> Self {
        Self {
            username: "sAMAccountName".to_string(),
            sid: "objectSid".to_string(),
            user_object_class: "user".to_string(),
            group_object_class: "group".to_string(),
            ..Self::default()
        }
    }
}
