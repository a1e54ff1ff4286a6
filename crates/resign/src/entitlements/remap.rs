//! Rewriting of identifiers embedded in entitlement values.

use super::grant::{EntitlementKey, EntitlementValue, GeneratedGrant};
use crate::ids::IdentifierMapper;
use crate::Result;

/// Prefix carried by the identifiers of a remapped key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapPrefix {
    Literal(&'static str),
    /// `TEAM.` of the target team.
    Team,
}

/// Declares how the identifiers under a set of keys are rewritten.
#[derive(Debug, Clone, Copy)]
pub struct RemapDef {
    pub keys: &'static [EntitlementKey],
    pub prefix: RemapPrefix,
    /// Only re-attach the new prefix, keep the bare identifier.
    pub prefix_only: bool,
    pub is_list: bool,
}

pub const STANDARD_REMAPS: [RemapDef; 4] = [
    RemapDef {
        keys: &[EntitlementKey::ApplicationGroups],
        prefix: RemapPrefix::Literal("group."),
        prefix_only: false,
        is_list: true,
    },
    RemapDef {
        keys: &[
            EntitlementKey::IcloudContainerIdentifiers,
            EntitlementKey::UbiquityContainerIdentifiers,
            EntitlementKey::IcloudDevelopmentContainerIdentifiers,
        ],
        prefix: RemapPrefix::Literal("iCloud."),
        prefix_only: false,
        is_list: true,
    },
    RemapDef {
        keys: &[EntitlementKey::KeychainAccessGroups],
        prefix: RemapPrefix::Team,
        prefix_only: true,
        is_list: true,
    },
    RemapDef {
        keys: &[EntitlementKey::UbiquityKvstoreIdentifier],
        prefix: RemapPrefix::Team,
        prefix_only: false,
        is_list: false,
    },
];

impl RemapDef {
    fn prefix(&self, team_id: &str) -> String {
        match self.prefix {
            RemapPrefix::Literal(p) => p.to_string(),
            RemapPrefix::Team => format!("{team_id}."),
        }
    }

    /// Identifier with its old prefix removed.
    ///
    /// Team-prefixed identifiers lose everything up to the first dot since
    /// the old team differs from the new one.
    fn bare<'a>(&self, id: &'a str, prefix: &str) -> &'a str {
        if let Some(rest) = id.strip_prefix(prefix) {
            return rest;
        }
        match self.prefix {
            RemapPrefix::Team => id.split_once('.').map(|(_, rest)| rest).unwrap_or(id),
            RemapPrefix::Literal(_) => id,
        }
    }

    /// Rewrites every matching key of `grant` in place.
    pub fn apply(
        &self,
        grant: &mut GeneratedGrant,
        team_id: &str,
        mapper: &mut IdentifierMapper,
    ) -> Result<()> {
        let prefix = self.prefix(team_id);
        for &key in self.keys {
            let ids = match grant.get(key) {
                Some(value @ (EntitlementValue::String(_) | EntitlementValue::List(_))) => {
                    value.identifiers()
                }
                _ => continue,
            };
            if ids.is_empty() {
                continue;
            }

            let mut rewritten = Vec::with_capacity(ids.len());
            for id in &ids {
                let bare = self.bare(id, &prefix);
                let new_id = if self.prefix_only {
                    format!("{prefix}{bare}")
                } else {
                    let generated = format!("{prefix}{}", mapper.get_or_create(bare));
                    mapper.register(&format!("{prefix}{bare}"), &generated)?;
                    generated
                };
                tracing::debug!(key = ?key, old = %id, new = %new_id, "remapped entitlement id");
                rewritten.push(new_id);
            }

            let value = if self.is_list {
                EntitlementValue::List(rewritten)
            } else {
                EntitlementValue::String(rewritten.swap_remove(0))
            };
            grant.insert(key, value);
        }
        Ok(())
    }
}
