//! Nested group membership traversal across providers

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::entity::{DirectoryEntity, DirectoryGroup, Identity};
use crate::error::Result;
use crate::ids::EntityKey;

/// Whether `entity` is a member of `group` directly or through nested groups.
///
/// Each group is queried through its own home provider, so a nested group
/// owned by another backend is introspected by that backend. Groups already
/// visited are skipped, which makes membership cycles terminate. Failures on
/// `group` itself are returned; failures on nested groups are logged and that
/// branch is treated as "not a member".
pub async fn is_member_nested(group: &DirectoryGroup, entity: &DirectoryEntity) -> Result<bool> {
    let root = group.key();
    let mut visited: HashSet<EntityKey> = HashSet::new();
    let mut pending: Vec<DirectoryGroup> = vec![group.clone()];

    while let Some(current) = pending.pop() {
        let key = current.key();
        if !visited.insert(key.clone()) {
            debug!("Skipping already visited group {}", key);
            continue;
        }

        match expand(&current, entity).await {
            Ok(Expansion::Hit) => {
                debug!(
                    "Entity {} found in group '{}' ({})",
                    entity.key(),
                    current.group_name(),
                    key
                );
                return Ok(true);
            }
            Ok(Expansion::Nested(groups)) => {
                // Reverse so the first listed member is examined first.
                for nested in groups.into_iter().rev() {
                    if !visited.contains(&nested.key()) {
                        pending.push(nested);
                    }
                }
            }
            Err(e) if key == root => return Err(e),
            Err(e) => {
                warn!(
                    "Error checking nested group membership for group '{}' ({}): {}",
                    current.group_name(),
                    key,
                    e
                );
            }
        }
    }

    debug!("Entity {} is not a member of group {}", entity.key(), root);
    Ok(false)
}

enum Expansion {
    Hit,
    Nested(Vec<DirectoryGroup>),
}

async fn expand(group: &DirectoryGroup, entity: &DirectoryEntity) -> Result<Expansion> {
    let provider = group.home_provider();

    if provider.is_direct_member(group, entity).await? {
        return Ok(Expansion::Hit);
    }

    let nested = provider
        .get_group_members(group)
        .await?
        .into_iter()
        .filter_map(|member| match member {
            DirectoryEntity::Group(g) => Some(g),
            DirectoryEntity::User(_) => None,
        })
        .collect();

    Ok(Expansion::Nested(nested))
}
