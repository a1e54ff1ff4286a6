//! Developer portal registration and profile issuance.
//!
//! [`Fastlane`] drives the `fastlane` tool: `spaceauth` for the session,
//! `produce` for app identifiers, services, app groups and iCloud
//! containers, and `sigh` for provisioning profiles.

use crate::entitlements::CapabilityGrant;
use crate::platform::Platform;
use crate::process;
use crate::{Error, Result};
use rayon::prelude::*;
use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeSet;
use std::path::Path;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

/// Supplies the second factor while the portal login waits for it.
pub trait TwoFactorSource {
    fn two_factor_code(&self) -> Result<Option<String>>;
}

/// Kind of provisioning profile to issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    Development,
    AdHoc,
}

impl ProfileKind {
    pub fn for_distribution(distribution: bool) -> Self {
        if distribution {
            ProfileKind::AdHoc
        } else {
            ProfileKind::Development
        }
    }

    fn flag(self) -> &'static str {
        match self {
            ProfileKind::Development => "development",
            ProfileKind::AdHoc => "adhoc",
        }
    }
}

/// Registers identifiers and issues provisioning profiles.
pub trait Provisioner {
    /// Establishes a portal session. Called once before any registration.
    fn authenticate(&mut self) -> Result<()>;

    /// Registers `bundle_id` with the services and extras `grant` needs.
    fn register_app(&self, bundle_id: &str, grant: &CapabilityGrant) -> Result<()>;

    /// Issues a profile for `bundle_id` and writes it to `out`.
    fn issue_profile(
        &self,
        bundle_id: &str,
        kind: ProfileKind,
        platform: Platform,
        out: &Path,
    ) -> Result<()>;
}

impl<T: Provisioner + ?Sized> Provisioner for Box<T> {
    fn authenticate(&mut self) -> Result<()> {
        (**self).authenticate()
    }

    fn register_app(&self, bundle_id: &str, grant: &CapabilityGrant) -> Result<()> {
        (**self).register_app(bundle_id, grant)
    }

    fn issue_profile(
        &self,
        bundle_id: &str,
        kind: ProfileKind,
        platform: Platform,
        out: &Path,
    ) -> Result<()> {
        (**self).issue_profile(bundle_id, kind, platform, out)
    }
}

/// Developer account used for portal calls.
#[derive(Debug, Clone)]
pub struct PortalAccount {
    pub name: String,
    pub password: SecretString,
    pub team_id: String,
}

const AUTH_TIMEOUT: Duration = Duration::from_secs(60);
const AUTH_POLL: Duration = Duration::from_secs(2);

/// Every service flag `produce` knows, reset before enabling.
const SERVICE_FLAGS: [&str; 15] = [
    "--push-notification",
    "--health-kit",
    "--home-kit",
    "--wireless-accessory",
    "--inter-app-audio",
    "--extended-virtual-address-space",
    "--multipath",
    "--network-extension",
    "--personal-vpn",
    "--access-wifi",
    "--nfc-tag-reading",
    "--siri-kit",
    "--associated-domains",
    "--icloud",
    "--app-group",
];

const ICLOUD_KEYS: [&str; 4] = [
    "com.apple.developer.icloud-container-development-container-identifiers",
    "com.apple.developer.icloud-container-identifiers",
    "com.apple.developer.ubiquity-container-identifiers",
    "com.apple.developer.ubiquity-kvstore-identifier",
];

const GROUP_KEYS: [&str; 1] = ["com.apple.security.application-groups"];

/// Entitlement key → `produce enable_services` arguments.
fn service_for(key: &str) -> Option<&'static [&'static str]> {
    let flags: &'static [&'static str] = match key {
        "aps-environment" | "com.apple.developer.aps-environment" => &["--push-notification"],
        "com.apple.developer.healthkit" => &["--health-kit"],
        "com.apple.developer.homekit" => &["--home-kit"],
        "com.apple.external-accessory.wireless-configuration" => &["--wireless-accessory"],
        "inter-app-audio" => &["--inter-app-audio"],
        "com.apple.developer.kernel.extended-virtual-addressing" => {
            &["--extended-virtual-address-space"]
        }
        "com.apple.developer.networking.multipath" => &["--multipath"],
        "com.apple.developer.networking.networkextension" => &["--network-extension"],
        "com.apple.developer.networking.vpn.api" => &["--personal-vpn"],
        "com.apple.developer.networking.wifi-info" => &["--access-wifi"],
        "com.apple.developer.nfc.readersession.formats" => &["--nfc-tag-reading"],
        "com.apple.developer.siri" => &["--siri-kit"],
        "com.apple.developer.associated-domains" => &["--associated-domains"],
        k if ICLOUD_KEYS.contains(&k) => &["--icloud", "xcode6_compatible"],
        k if GROUP_KEYS.contains(&k) => &["--app-group"],
        _ => return None,
    };
    Some(flags)
}

/// Service arguments for every capability in `grant`, without duplicates.
pub fn service_flags(grant: &CapabilityGrant) -> Vec<&'static str> {
    let mut seen = BTreeSet::new();
    let mut flags = Vec::new();
    for key in grant.key_names() {
        if let Some(service) = service_for(&key) {
            if seen.insert(service) {
                flags.extend_from_slice(service);
            }
        }
    }
    flags
}

/// App group or iCloud container registrations.
#[derive(Debug, Clone, Copy)]
struct Extra {
    kind: &'static str,
    prefix: &'static str,
    keys: &'static [&'static str],
}

const EXTRAS: [Extra; 2] = [
    Extra {
        kind: "cloud_container",
        prefix: "iCloud.",
        keys: &ICLOUD_KEYS,
    },
    Extra {
        kind: "group",
        prefix: "group.",
        keys: &GROUP_KEYS,
    },
];

impl Extra {
    /// Identifiers to register, re-prefixed where the entitlement carried a
    /// team prefix instead.
    fn identifiers(&self, grant: &CapabilityGrant) -> BTreeSet<String> {
        self.keys
            .iter()
            .flat_map(|key| grant.identifiers(key))
            .map(|id| {
                if id.starts_with(self.prefix) {
                    id
                } else {
                    let bare = id.split_once('.').map(|(_, rest)| rest).unwrap_or(id.as_str());
                    format!("{}{}", self.prefix, bare)
                }
            })
            .collect()
    }
}

/// Portal name: runs of anything but ASCII letters and digits become one
/// space.
pub fn portal_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut gap = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if gap && !out.is_empty() {
                out.push(' ');
            }
            gap = false;
            out.push(c);
        } else {
            gap = true;
        }
    }
    out
}

/// `fastlane` backed [`Provisioner`].
pub struct Fastlane<'a> {
    account: PortalAccount,
    two_factor: Option<&'a dyn TwoFactorSource>,
}

impl<'a> Fastlane<'a> {
    pub fn new(account: PortalAccount) -> Self {
        Self {
            account,
            two_factor: None,
        }
    }

    /// Polls `source` for a 2FA code during authentication.
    pub fn two_factor(mut self, source: &'a dyn TwoFactorSource) -> Self {
        self.two_factor = Some(source);
        self
    }

    fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("FASTLANE_USER", self.account.name.clone()),
            ("FASTLANE_PASSWORD", self.account.password.expose_secret().to_string()),
            ("FASTLANE_TEAM_ID", self.account.team_id.clone()),
        ]
    }

    fn produce(env: &[(&'static str, String)], args: &[&str]) -> Command {
        let mut cmd = Command::new("fastlane");
        cmd.arg("produce").args(args).arg("--skip_itc");
        cmd.envs(env.iter().map(|(k, v)| (*k, v.as_str())));
        cmd
    }

    fn register_extra(
        env: &[(&'static str, String)],
        bundle_id: &str,
        extra: &Extra,
        grant: &CapabilityGrant,
    ) -> Result<()> {
        let ids = extra.identifiers(grant);
        if ids.is_empty() {
            return Ok(());
        }

        let mut jobs = Vec::with_capacity(ids.len());
        for id in &ids {
            let name = portal_name(&format!("ST {id}"));
            let spawned = process::spawn(&mut Self::produce(env, &[extra.kind, "-g", id, "-n", &name]));
            jobs.push(spawned);
        }
        let mut first_error = None;
        for job in jobs {
            if let Err(e) = job.and_then(|p| p.wait()) {
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let associate = format!("associate_{}", extra.kind);
        let mut args = vec![associate.as_str(), "--app_identifier", bundle_id];
        args.extend(ids.iter().map(String::as_str));
        process::run(&mut Self::produce(env, &args))?;
        tracing::info!(bundle_id, kind = extra.kind, count = ids.len(), "registered extras");
        Ok(())
    }
}

impl Provisioner for Fastlane<'_> {
    fn authenticate(&mut self) -> Result<()> {
        tracing::info!("logging in, submit any 2FA code to the web service");
        let mut cmd = Command::new("fastlane");
        cmd.args(["spaceauth", "--copy_to_clipboard"]).envs(self.env());
        let mut child = process::spawn_interactive(&mut cmd)?;

        let start = Instant::now();
        loop {
            if child.has_exited()? {
                return child.wait().map(|_| tracing::info!("logged in"));
            }
            if start.elapsed() > AUTH_TIMEOUT {
                tracing::warn!(command = %child.label(), "no 2FA code arrived in time");
                child.kill();
                return Err(Error::Timeout("portal authentication".into()));
            }

            let code = match self.two_factor.map(|s| s.two_factor_code()) {
                Some(Ok(code)) => code,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "failed to fetch 2FA code");
                    None
                }
                None => None,
            };
            if let Some(code) = code {
                child.send_line(&code)?;
                tracing::info!("submitted 2FA code");
                return child.wait().map(|_| tracing::info!("logged in"));
            }

            tracing::info!("waiting for 2FA code");
            thread::sleep(AUTH_POLL);
        }
    }

    fn register_app(&self, bundle_id: &str, grant: &CapabilityGrant) -> Result<()> {
        let env = self.env();
        let name = portal_name(&format!("ST {bundle_id}"));
        process::run(&mut Self::produce(
            &env,
            &["create", "--app_identifier", bundle_id, "--app-name", &name],
        ))?;

        let mut disable = vec!["disable_services", "--app_identifier", bundle_id];
        disable.extend(SERVICE_FLAGS);
        process::run(&mut Self::produce(&env, &disable))?;

        let flags = service_flags(grant);
        tracing::info!(bundle_id, services = ?flags, "enabling services");
        let mut enable = vec!["enable_services", "--app_identifier", bundle_id];
        enable.extend(flags);
        process::run(&mut Self::produce(&env, &enable))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(EXTRAS.len())
            .build()
            .map_err(|e| Error::Config(format!("Failed to create thread pool: {e}")))?;
        pool.install(|| {
            EXTRAS
                .par_iter()
                .map(|extra| Self::register_extra(&env, bundle_id, extra, grant))
                .collect::<Result<Vec<()>>>()
        })?;
        Ok(())
    }

    fn issue_profile(
        &self,
        bundle_id: &str,
        kind: ProfileKind,
        platform: Platform,
        out: &Path,
    ) -> Result<()> {
        let dir = tempfile::tempdir()?;
        let name = portal_name(&format!("ST {bundle_id} {}", kind.flag()));
        let mut cmd = Command::new("fastlane");
        cmd.args(["sigh", "renew", "--app_identifier", bundle_id])
            .args(["--provisioning_name", &name])
            .args(["--force", "--skip_install", "--include_mac_in_profiles"])
            .args(["--platform", platform.portal_name()])
            .arg(format!("--{}", kind.flag()))
            .arg("--output_path")
            .arg(dir.path())
            .args(["--filename", "prov.mobileprovision"])
            .envs(self.env());
        process::run(&mut cmd)?;
        std::fs::copy(dir.path().join("prov.mobileprovision"), out)?;
        tracing::info!(bundle_id, kind = kind.flag(), out = %out.display(), "issued provisioning profile");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entitlements::{EntitlementKey, EntitlementValue, GeneratedGrant};
    use plist::{Dictionary, Value};

    fn grant() -> CapabilityGrant {
        let mut g = GeneratedGrant::new(Platform::Ios);
        g.insert(EntitlementKey::ApsEnvironment, EntitlementValue::String("development".into()));
        g.insert(
            EntitlementKey::IcloudContainerIdentifiers,
            EntitlementValue::List(vec!["iCloud.com.x".into()]),
        );
        g.insert(
            EntitlementKey::UbiquityKvstoreIdentifier,
            EntitlementValue::String("TEAM123456.com.x".into()),
        );
        g.insert(
            EntitlementKey::ApplicationGroups,
            EntitlementValue::List(vec!["group.com.x".into()]),
        );
        g.insert(EntitlementKey::GetTaskAllow, EntitlementValue::Bool(true));
        CapabilityGrant::Generated(g)
    }

    #[test]
    fn test_portal_name() {
        assert_eq!(portal_name("ST com.example.app"), "ST com example app");
        assert_eq!(portal_name("--a__b--"), "a b");
    }

    #[test]
    fn test_service_flags_deduplicated() {
        let flags = service_flags(&grant());
        assert_eq!(
            flags.iter().filter(|f| **f == "--icloud").count(),
            1,
            "{flags:?}"
        );
        assert!(flags.contains(&"--push-notification"));
        assert!(flags.contains(&"--app-group"));
        assert!(flags.contains(&"xcode6_compatible"));
    }

    #[test]
    fn test_macos_push_key() {
        let mut dict = Dictionary::new();
        dict.insert("com.apple.developer.aps-environment".into(), Value::String("production".into()));
        let flags = service_flags(&CapabilityGrant::Inherited(dict));
        assert_eq!(flags, vec!["--push-notification"]);
    }

    #[test]
    fn test_extra_identifiers_are_reprefixed() {
        let ids = EXTRAS[0].identifiers(&grant());
        assert_eq!(
            ids.into_iter().collect::<Vec<_>>(),
            vec!["iCloud.com.x".to_string()]
        );
        let groups = EXTRAS[1].identifiers(&grant());
        assert_eq!(groups.len(), 1);
    }

    #[test]
    fn test_profile_kind() {
        assert_eq!(ProfileKind::for_distribution(true), ProfileKind::AdHoc);
        assert_eq!(ProfileKind::for_distribution(false).flag(), "development");
    }
}
