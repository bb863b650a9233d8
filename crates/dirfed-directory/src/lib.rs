//! dirfed directory - provider registry, aggregated directory service and backends
//!
//! This crate provides:
//! - `ProviderRegistry`: registers providers and builds the `DirectoryService`
//! - `DirectoryService`: fans searches and sid lookups out across providers
//! - Backend providers:
//!   - JSON file store (feature `json`)
//!   - LDAP and Active Directory (feature `ldap`)
//!
//! # Architecture
//!
//! Each provider implements `DirectoryProvider` from `dirfed-core`. Groups
//! delegate membership operations to the provider that owns them, and
//! providers reach each other through the registry's `PeerDirectory` handle
//! when a group holds foreign members.

pub mod aggregator;
pub mod providers;
pub mod registry;

#[cfg(test)]
mod tests;

#[cfg(feature = "json")]
pub use providers::json::JsonFileProvider;

#[cfg(feature = "ldap")]
pub use providers::ldap::LdapProvider;

pub use aggregator::DirectoryService;
pub use registry::ProviderRegistry;

// Re-export core types
pub use dirfed_core::*;
