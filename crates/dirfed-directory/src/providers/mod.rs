//! Directory provider implementations

#[cfg(feature = "json")]
pub mod json;

#[cfg(feature = "ldap")]
pub mod ldap;

mod common;

pub use common::*;
