//! Derivation of the final capability grant of each primary component.

use super::grant::{CapabilityGrant, EntitlementKey, EntitlementValue, GeneratedGrant};
use super::profile::ProvisioningProfile;
use super::remap::STANDARD_REMAPS;
use crate::ids::IdentifierMapper;
use crate::platform::Platform;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::collections::BTreeSet;

/// Where grants come from. Chosen once per run.
#[derive(Debug, Clone)]
pub enum ResolveMode {
    /// Build from the component's own entitlements, filtered to the
    /// allow-list.
    Generate,
    /// Start from the entitlements of a supplied provisioning profile.
    Inherit(ProvisioningProfile),
}

#[derive(Debug, Clone)]
pub struct ResolverOptions {
    pub platform: Platform,
    pub team_id: String,
    pub distribution: bool,
    pub encode_ids: bool,
    /// Force `get-task-allow`; when unset the key is stripped.
    pub debuggable: bool,
}

/// Entitlements Resolver.
///
/// Keeps the set of entitlement keys dropped across all components for the
/// audit report.
#[derive(Debug)]
pub struct EntitlementsResolver {
    mode: ResolveMode,
    options: ResolverOptions,
    removed: BTreeSet<String>,
}

impl EntitlementsResolver {
    pub fn new(mode: ResolveMode, options: ResolverOptions) -> Self {
        Self {
            mode,
            options,
            removed: BTreeSet::new(),
        }
    }

    /// Keys dropped by the allow-list so far.
    pub fn removed(&self) -> &BTreeSet<String> {
        &self.removed
    }

    /// Resolves the grant of one primary component.
    ///
    /// `original` is the component's current entitlements, empty when they
    /// could not be read. `bundle_id` is its newly assigned identifier.
    pub fn resolve(
        &mut self,
        original: &Dictionary,
        bundle_id: &str,
        mapper: &mut IdentifierMapper,
    ) -> Result<CapabilityGrant> {
        let mut grant = match &self.mode {
            ResolveMode::Generate => {
                let grant = self.generate(original, bundle_id, mapper)?;
                CapabilityGrant::Generated(grant)
            }
            ResolveMode::Inherit(profile) => {
                CapabilityGrant::Inherited(self.inherit(profile, original, bundle_id)?)
            }
        };
        grant.set_debuggable(self.options.debuggable);
        Ok(grant)
    }

    fn generate(
        &mut self,
        original: &Dictionary,
        bundle_id: &str,
        mapper: &mut IdentifierMapper,
    ) -> Result<GeneratedGrant> {
        let ResolverOptions {
            platform,
            ref team_id,
            distribution,
            encode_ids,
            ..
        } = self.options;

        let mut grant = GeneratedGrant::new(platform);
        for (name, value) in original {
            let key = EntitlementKey::parse(name, platform);
            match (key, EntitlementValue::from_plist(value)) {
                (Some(key), Some(value)) => grant.insert(key, value),
                _ => {
                    tracing::debug!(key = %name, "dropping unsupported entitlement");
                    self.removed.insert(name.clone());
                }
            }
        }

        let env = |prod: &str, dev: &str| {
            EntitlementValue::String(if distribution { prod } else { dev }.to_string())
        };
        if grant.contains(EntitlementKey::IcloudContainerEnvironment) {
            grant.insert(
                EntitlementKey::IcloudContainerEnvironment,
                env("Production", "Development"),
            );
        }
        if grant.contains(EntitlementKey::ApsEnvironment) {
            grant.insert(EntitlementKey::ApsEnvironment, env("production", "development"));
        }
        if grant.contains(EntitlementKey::GetTaskAllow) {
            grant.insert(EntitlementKey::GetTaskAllow, EntitlementValue::Bool(!distribution));
        }

        grant.insert(
            EntitlementKey::TeamIdentifier,
            EntitlementValue::String(team_id.clone()),
        );
        grant.insert(
            EntitlementKey::ApplicationIdentifier,
            EntitlementValue::String(format!("{team_id}.{bundle_id}")),
        );

        if encode_ids {
            for def in &STANDARD_REMAPS {
                def.apply(&mut grant, team_id, mapper)?;
            }
        }
        Ok(grant)
    }

    fn inherit(
        &self,
        profile: &ProvisioningProfile,
        original: &Dictionary,
        bundle_id: &str,
    ) -> Result<Dictionary> {
        let platform = self.options.platform;
        let team_id = &self.options.team_id;
        let mut entitlements = profile.entitlements().clone();

        let app_id_key = platform.application_identifier_key();
        let profile_app_id = profile.application_identifier(platform).ok_or_else(|| {
            Error::ProvisioningProfile(format!("profile has no {app_id_key} entitlement"))
        })?;
        let component_app_id = format!("{team_id}.{bundle_id}");
        if profile_app_id == format!("{team_id}.*") {
            entitlements.insert(app_id_key.to_string(), Value::String(component_app_id));
        } else if profile_app_id != component_app_id {
            tracing::warn!(
                profile_app_id,
                component_app_id = %component_app_id,
                "provisioning profile app id does not match, features like file importing may not work"
            );
        }

        let keychain_key = EntitlementKey::KeychainAccessGroups.name(platform);
        let original_groups: Option<Vec<String>> = original
            .get(keychain_key)
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect()
            });
        match original_groups {
            None => {
                entitlements.remove(keychain_key);
            }
            Some(groups) => {
                let wildcard = format!("{team_id}.*");
                let has_wildcard = entitlements
                    .get(keychain_key)
                    .and_then(Value::as_array)
                    .map(|items| items.iter().any(|v| v.as_string() == Some(wildcard.as_str())))
                    .unwrap_or(false);
                if has_wildcard {
                    let regrouped = groups
                        .iter()
                        .map(|group| {
                            let bare = group.split_once('.').map(|(_, rest)| rest).unwrap_or(group.as_str());
                            Value::String(format!("{team_id}.{bare}"))
                        })
                        .collect();
                    entitlements.insert(keychain_key.to_string(), Value::Array(regrouped));
                }
            }
        }
        Ok(entitlements)
    }
}

/// Registers the old team identifier and app-id prefix of `original` as
/// mapping to `team_id`, so they get patched along with bundle ids.
///
/// Prefixes of a different length cannot be patched in place and are only
/// reported.
pub fn register_team_mappings(
    original: &Dictionary,
    platform: Platform,
    team_id: &str,
    mapper: &mut IdentifierMapper,
) -> Result<()> {
    let old_team = original
        .get(EntitlementKey::TeamIdentifier.name(platform))
        .and_then(Value::as_string);
    let old_prefix = original
        .get(platform.application_identifier_key())
        .and_then(Value::as_string)
        .and_then(|id| id.split_once('.'))
        .map(|(prefix, _)| prefix);

    for (kind, old) in [("team id", old_team), ("app id prefix", old_prefix)] {
        let Some(old) = old else { continue };
        if old == team_id {
            continue;
        }
        if old.len() != team_id.len() {
            tracing::warn!(kind, old, new = team_id, "length mismatch, not mapping");
            continue;
        }
        mapper.register(old, team_id)?;
    }
    Ok(())
}
