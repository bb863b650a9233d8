//! Common utilities shared by provider implementations

use std::sync::{Arc, Weak};

use dirfed_core::{DirectoryError, DirectoryProvider, Result};

/// Case-insensitive name comparison used for usernames and group names
pub fn names_match(a: &str, b: &str) -> bool {
    a == b || a.to_lowercase() == b.to_lowercase()
}

/// Case-insensitive substring match
pub fn name_contains(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Upgrade a provider's handle to itself, for binding groups it returns.
pub fn self_handle<P>(me: &Weak<P>) -> Result<Arc<dyn DirectoryProvider>>
where
    P: DirectoryProvider + 'static,
{
    let provider: Arc<dyn DirectoryProvider> = me
        .upgrade()
        .ok_or_else(|| DirectoryError::invalid_state("Provider is shutting down"))?;
    Ok(provider)
}
