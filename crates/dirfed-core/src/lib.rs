//! dirfed core - entity model, provider contract and errors for federated directories
//!
//! A directory federation is a set of independent backends (providers) that
//! each own their users and groups. Groups may hold members owned by other
//! providers when the group's provider agrees to resolve them; membership
//! checks follow nested groups across providers.

pub mod config;
pub mod entity;
pub mod error;
pub mod ids;
pub mod membership;
pub mod peers;
pub mod provider;
pub mod sid;


pub use config::*;
pub use entity::*;
pub use error::*;
pub use ids::*;
pub use peers::{PeerDirectory, ProviderSet};
pub use provider::*;
