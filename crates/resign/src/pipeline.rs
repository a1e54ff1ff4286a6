//! Re-signing pipeline.
//!
//! [`Signer`] takes an extracted bundle tree through every stage: scanning,
//! identifier assignment, entitlement resolution, patching and ordered
//! signing. All mutable state of a run lives in one [`SigningContext`]
//! that the signer owns for the duration of [`Signer::sign`].

use crate::bundle::{
    find_info_plist, find_main_app, BundleComponent, BundleTree, InfoPatches, InfoPlist,
};
use crate::entitlements::{
    capabilities, register_team_mappings, EntitlementsResolver, ProvisioningProfile, ResolveMode,
    ResolverOptions,
};
use crate::ids::{
    derive_nested_id, resolve_main_id, BundleIdRequest, IdentifierMapper, IdentifierStore,
    MainIdInputs,
};
use crate::patch::Patcher;
use crate::platform::Platform;
use crate::portal::{Fastlane, PortalAccount, ProfileKind, Provisioner};
use crate::progress::{NoProgress, Progress};
use crate::sign::{CodeSigner, Codesign, LaunchHook, SigningCoordinator};
use crate::{Error, Result};
use plist::Dictionary;
use secrecy::SecretString;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Directories removed from the main application before signing.
const WATCH_PLACEHOLDERS: [&str; 2] = ["com.apple.WatchPlaceholder", "Watch"];

/// Configuration of one signing run.
///
/// # Example
///
/// ```no_run
/// use resign::SignOptions;
///
/// let options = SignOptions::new("/tmp/extracted", "Apple Development: Jane (ABCDE12345)")
///     .team_id("ABCDE12345")
///     .account("jane@example.com", "app-specific-password")
///     .encode_ids(true)
///     .patch_ids(true)
///     .mapper_secret("per-deployment secret");
/// ```
#[derive(Debug, Clone)]
pub struct SignOptions {
    app_dir: PathBuf,
    identity: String,
    keychain: Option<PathBuf>,
    team_id: Option<String>,
    account_name: Option<String>,
    account_password: Option<SecretString>,
    provisioning_profile: Option<PathBuf>,
    bundle_id: BundleIdRequest,
    display_name: Option<String>,
    distribution: bool,
    patch_debug: bool,
    info_patches: InfoPatches,
    encode_ids: bool,
    patch_ids: bool,
    force_original_id: bool,
    mapper_secret: String,
}

impl SignOptions {
    /// Signs the tree under `app_dir` with the keychain identity `identity`.
    ///
    /// Identities whose name contains `Distribution` select distribution
    /// signing; see [`SignOptions::distribution`].
    pub fn new(app_dir: impl AsRef<Path>, identity: impl Into<String>) -> Self {
        let identity = identity.into();
        Self {
            app_dir: app_dir.as_ref().to_path_buf(),
            distribution: identity.contains("Distribution"),
            identity,
            keychain: None,
            team_id: None,
            account_name: None,
            account_password: None,
            provisioning_profile: None,
            bundle_id: BundleIdRequest::Original,
            display_name: None,
            patch_debug: true,
            info_patches: InfoPatches::default(),
            encode_ids: false,
            patch_ids: false,
            force_original_id: false,
            mapper_secret: String::new(),
        }
    }

    /// Keychain the signing tool looks the identity up in.
    pub fn keychain(mut self, path: impl AsRef<Path>) -> Self {
        self.keychain = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn team_id(mut self, team_id: impl Into<String>) -> Self {
        self.team_id = Some(team_id.into());
        self
    }

    /// Developer account used to register identifiers and issue profiles
    /// when no provisioning profile is supplied.
    pub fn account(mut self, name: impl Into<String>, password: impl Into<String>) -> Self {
        self.account_name = Some(name.into());
        self.account_password = Some(SecretString::from(password.into()));
        self
    }

    /// Inherits entitlements from this profile and embeds it instead of
    /// requesting new ones.
    pub fn provisioning_profile(mut self, path: impl AsRef<Path>) -> Self {
        self.provisioning_profile = Some(path.as_ref().to_path_buf());
        self
    }

    /// Main bundle identifier request; see [`BundleIdRequest::from_option`].
    pub fn bundle_id(mut self, request: BundleIdRequest) -> Self {
        self.bundle_id = request;
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Overrides the distribution flag derived from the identity name.
    pub fn distribution(mut self, enabled: bool) -> Self {
        self.distribution = enabled;
        self
    }

    /// Sets `get-task-allow` on every primary grant (default), or strips it.
    pub fn patch_debug(mut self, enabled: bool) -> Self {
        self.patch_debug = enabled;
        self
    }

    /// Also lowers the minimum OS version of the main bundle.
    pub fn patch_all_devices(mut self, enabled: bool) -> Self {
        self.info_patches.all_devices = enabled;
        self
    }

    pub fn patch_mac(mut self, enabled: bool) -> Self {
        self.info_patches.mac_compat = enabled;
        self
    }

    pub fn patch_file_sharing(mut self, enabled: bool) -> Self {
        self.info_patches.file_sharing = enabled;
        self
    }

    /// Replaces identifiers with derived ones of the same shape.
    pub fn encode_ids(mut self, enabled: bool) -> Self {
        self.encode_ids = enabled;
        self
    }

    /// Rewrites identifier occurrences inside binaries and descriptors.
    pub fn patch_ids(mut self, enabled: bool) -> Self {
        self.patch_ids = enabled;
        self
    }

    /// Keeps each component's original `CFBundleIdentifier`.
    pub fn force_original_id(mut self, enabled: bool) -> Self {
        self.force_original_id = enabled;
        self
    }

    /// Seed for identifier derivation. Must stay the same across retries.
    pub fn mapper_secret(mut self, secret: impl Into<String>) -> Self {
        self.mapper_secret = secret.into();
        self
    }

    pub fn app_dir(&self) -> &Path {
        &self.app_dir
    }

    pub fn is_distribution(&self) -> bool {
        self.distribution
    }

    /// Checks the configuration before any work is done.
    pub fn validate(&self) -> Result<()> {
        if !self.app_dir.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                self.app_dir.display()
            )));
        }
        if self.identity.trim().is_empty() {
            return Err(Error::MissingCredentials("no signing identity".into()));
        }
        Ok(())
    }

    fn portal_account(&self, team_id: &str) -> Option<PortalAccount> {
        Some(PortalAccount {
            name: self.account_name.clone()?,
            password: self.account_password.clone()?,
            team_id: team_id.to_string(),
        })
    }
}

/// State shared by every stage of one run.
#[derive(Debug)]
pub struct SigningContext {
    pub platform: Platform,
    pub team_id: String,
    pub tree: BundleTree,
    pub mapper: IdentifierMapper,
    pub resolver: EntitlementsResolver,
    pub original_main_id: String,
    pub main_id: String,
    /// Capabilities detected in the original primary components.
    pub capabilities: BTreeSet<String>,
    /// Entitlements the main application was originally signed with.
    pub main_entitlements: Dictionary,
}

impl SigningContext {
    /// Audit view of the context.
    pub fn report(&self) -> SignReport {
        SignReport {
            original_bundle_id: self.original_main_id.clone(),
            main_bundle_id: self.main_id.clone(),
            mappings: self.mapper.snapshot(),
            removed_entitlements: self.resolver.removed().clone(),
            components: self.tree.components.len(),
            capabilities: self.capabilities.clone(),
            original_entitlements: self.main_entitlements.clone(),
        }
    }
}

/// Outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignReport {
    pub original_bundle_id: String,
    pub main_bundle_id: String,
    /// Every identifier substitution made.
    pub mappings: BTreeMap<String, String>,
    /// Entitlement keys dropped from generated grants.
    pub removed_entitlements: BTreeSet<String>,
    pub components: usize,
    pub capabilities: BTreeSet<String>,
    #[serde(skip)]
    pub original_entitlements: Dictionary,
}

/// Drives a whole signing run.
pub struct Signer<'a> {
    options: SignOptions,
    code_signer: Box<dyn CodeSigner + 'a>,
    provisioner: Option<Box<dyn Provisioner + 'a>>,
    store: Option<&'a dyn IdentifierStore>,
    progress: &'a dyn Progress,
}

impl<'a> Signer<'a> {
    /// Creates a signer using `codesign` and, when an account is configured,
    /// `fastlane`.
    pub fn new(options: SignOptions) -> Result<Self> {
        options.validate()?;
        let mut codesign = Codesign::new(options.identity.clone());
        if let Some(keychain) = &options.keychain {
            codesign = codesign.keychain(keychain);
        }
        let provisioner = options
            .team_id
            .as_deref()
            .and_then(|team| options.portal_account(team))
            .map(|account| Box::new(Fastlane::new(account)) as Box<dyn Provisioner + 'a>);
        Ok(Self {
            options,
            code_signer: Box::new(codesign),
            provisioner,
            store: None,
            progress: &NoProgress,
        })
    }

    pub fn code_signer(mut self, signer: impl CodeSigner + 'a) -> Self {
        self.code_signer = Box::new(signer);
        self
    }

    pub fn provisioner(mut self, provisioner: impl Provisioner + 'a) -> Self {
        self.provisioner = Some(Box::new(provisioner));
        self
    }

    /// Store consulted for identifiers issued by earlier runs.
    pub fn identifier_store(mut self, store: &'a dyn IdentifierStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn options(&self) -> &SignOptions {
        &self.options
    }

    /// Signs the whole tree in place.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MissingCredentials`] before touching the tree or any
    /// remote store when there is neither a provisioning profile nor a
    /// developer account to issue one.
    pub fn sign(&mut self) -> Result<SignReport> {
        let profile = self.options.provisioning_profile.clone();
        if profile.is_none() && self.provisioner.is_none() {
            return Err(Error::MissingCredentials(
                "a developer account or provisioning profile is required".into(),
            ));
        }

        let ctx = self.prepare()?;
        let report = ctx.report();
        tracing::info!(
            report = %serde_json::to_string_pretty(&report)?,
            "prepared signing context"
        );

        if profile.is_none() {
            if let Some(provisioner) = self.provisioner.as_mut() {
                self.progress.report(40, "Authenticating with the developer portal");
                provisioner.authenticate()?;
            }
        }

        let mut coordinator = SigningCoordinator::new(self.code_signer.as_ref());
        if self.options.patch_ids {
            coordinator = coordinator.with_patcher(Patcher::new(&ctx.mapper));
        }
        let mut setup = ComponentSetup {
            options: &self.options,
            platform: ctx.platform,
            profile: profile.as_deref(),
            provisioner: self.provisioner.as_deref(),
        };
        coordinator.run(&ctx.tree.components, &mut setup, self.progress)?;
        tracing::info!(bundle_id = %report.main_bundle_id, "signing complete");
        Ok(report)
    }

    /// Builds the context: scans the tree, assigns identifiers and resolves
    /// every primary grant. Nothing is signed yet.
    pub fn prepare(&self) -> Result<SigningContext> {
        let options = &self.options;
        let main_app = find_main_app(&options.app_dir)?;
        let main_info = find_info_plist(&main_app)?;
        let platform = Platform::detect(&main_info);
        if platform.is_macos() && options.distribution {
            return Err(Error::Config(
                "distribution certificates cannot sign macOS apps".into(),
            ));
        }

        let profile = options
            .provisioning_profile
            .as_ref()
            .map(ProvisioningProfile::load)
            .transpose()?;
        if let Some(profile) = &profile {
            tracing::info!(
                path = %profile.path().display(),
                name = profile.name().unwrap_or_default(),
                "using supplied provisioning profile"
            );
        }
        let team_id = options
            .team_id
            .clone()
            .or_else(|| profile.as_ref().and_then(|p| p.team_ids().first().cloned()))
            .ok_or_else(|| Error::MissingCredentials("no team id".into()))?;

        remove_watch_placeholders(&main_app)?;
        let tree = BundleTree::scan_app(main_app)?;

        let mut mapper = IdentifierMapper::new(options.mapper_secret.clone());
        let mut info = InfoPlist::load(&main_info)?;
        let original_main_id = info.bundle_identifier()?.to_string();

        let profile_app_id = profile
            .as_ref()
            .map(|p| {
                p.application_identifier(platform)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::ProvisioningProfile("profile has no application identifier".into())
                    })
            })
            .transpose()?;
        let main_id = resolve_main_id(
            &MainIdInputs {
                original: &original_main_id,
                request: &options.bundle_id,
                profile_app_id: profile_app_id.as_deref(),
                encode_ids: options.encode_ids,
                store: self.store,
            },
            &mut mapper,
        );
        if !options.force_original_id && main_id != original_main_id {
            mapper.register(&original_main_id, &main_id)?;
        }

        if let Some(name) = &options.display_name {
            tracing::info!(name = %name, "setting CFBundleDisplayName");
            info.set_display_name(name);
        }
        if options.info_patches.all_devices {
            info.patch_minimum_version(platform);
        }
        info.save()?;

        let mode = match profile {
            Some(profile) => ResolveMode::Inherit(profile),
            None => ResolveMode::Generate,
        };
        let resolver = EntitlementsResolver::new(
            mode,
            ResolverOptions {
                platform,
                team_id: team_id.clone(),
                distribution: options.distribution,
                encode_ids: options.encode_ids,
                debuggable: options.patch_debug,
            },
        );

        let mut ctx = SigningContext {
            platform,
            team_id,
            tree,
            mapper,
            resolver,
            original_main_id,
            main_id,
            capabilities: BTreeSet::new(),
            main_entitlements: Dictionary::new(),
        };
        self.assign_ids(&mut ctx)?;
        self.resolve_grants(&mut ctx)?;
        Ok(ctx)
    }

    /// Gives every primary component its identifier. Runs before any grant
    /// is resolved so entitlement remaps never claim a bundle identifier.
    fn assign_ids(&self, ctx: &mut SigningContext) -> Result<()> {
        let force_original = self.options.force_original_id;
        for component in ctx.tree.components.iter_mut().filter(|c| c.is_primary()) {
            let Some(old_id) = component.original_id.clone() else {
                continue;
            };
            let new_id = if old_id == ctx.original_main_id {
                ctx.main_id.clone()
            } else {
                match derive_nested_id(&ctx.original_main_id, &ctx.main_id, &old_id) {
                    Some(id) => id,
                    None if self.options.encode_ids => ctx.mapper.get_or_create(&old_id),
                    None => old_id.clone(),
                }
            };

            if !force_original && new_id != old_id {
                if new_id.len() == old_id.len() {
                    ctx.mapper.register(&old_id, &new_id)?;
                } else {
                    tracing::warn!(
                        original = %old_id,
                        bundle_id = %new_id,
                        "component bundle id changes length, the signed app may crash"
                    );
                }
            }
            tracing::debug!(path = %component.path.display(), bundle_id = %new_id, "assigned bundle id");
            component.assigned_id = Some(new_id);
        }
        Ok(())
    }

    fn resolve_grants(&self, ctx: &mut SigningContext) -> Result<()> {
        let SigningContext {
            platform,
            team_id,
            tree,
            mapper,
            resolver,
            capabilities: detected,
            main_entitlements,
            ..
        } = ctx;
        let main_path = tree.main_app.clone();
        for component in tree.components.iter_mut().filter(|c| c.is_primary()) {
            let Some(bundle_id) = component.assigned_id.clone() else {
                continue;
            };
            let original = match self.original_entitlements(component) {
                Some(dict) => {
                    detected.extend(capabilities::from_entitlements(&dict));
                    dict
                }
                None => {
                    let info = component
                        .info_plist
                        .as_ref()
                        .and_then(|p| InfoPlist::load(p).ok());
                    if let Some(info) = info {
                        detected.extend(capabilities::from_info_plist(info.dictionary()));
                    }
                    Dictionary::new()
                }
            };
            if component.path == main_path {
                *main_entitlements = original.clone();
            }
            register_team_mappings(&original, *platform, team_id, mapper)?;
            let grant = resolver.resolve(&original, &bundle_id, mapper)?;
            tracing::debug!(
                path = %component.path.display(),
                entitlements = ?grant.key_names(),
                "resolved entitlements"
            );
            component.grant = Some(grant);
        }
        Ok(())
    }

    fn original_entitlements(&self, component: &BundleComponent) -> Option<Dictionary> {
        match self.code_signer.dump_entitlements(&component.path) {
            Ok(dict) => Some(dict),
            Err(e) => {
                tracing::warn!(
                    path = %component.path.display(),
                    error = %e,
                    "failed to dump entitlements, using empty"
                );
                None
            }
        }
    }
}

/// Per-component work done right before a primary component is signed.
struct ComponentSetup<'s> {
    options: &'s SignOptions,
    platform: Platform,
    profile: Option<&'s Path>,
    provisioner: Option<&'s dyn Provisioner>,
}

impl LaunchHook for ComponentSetup<'_> {
    fn before_launch(&mut self, component: &BundleComponent) -> Result<()> {
        let (Some(info_path), Some(bundle_id)) = (&component.info_plist, &component.assigned_id)
        else {
            return Ok(());
        };

        let mut info = InfoPlist::load(info_path)?;
        match (&component.original_id, self.options.force_original_id) {
            (Some(original), true) => {
                tracing::info!(bundle_id = %original, "keeping original CFBundleIdentifier");
                info.set_bundle_identifier(original);
            }
            _ => {
                tracing::info!(bundle_id = %bundle_id, "setting CFBundleIdentifier");
                info.set_bundle_identifier(bundle_id);
            }
        }
        info.apply_patches(self.platform, &self.options.info_patches);
        info.save()?;

        let embedded = info_path.with_file_name(self.platform.embedded_profile_name());
        match (self.profile, self.provisioner) {
            (Some(profile), _) => {
                fs::copy(profile, &embedded)?;
            }
            (None, Some(provisioner)) => {
                if let Some(grant) = &component.grant {
                    tracing::info!(bundle_id = %bundle_id, "registering component");
                    provisioner.register_app(bundle_id, grant)?;
                }
                provisioner.issue_profile(
                    bundle_id,
                    ProfileKind::for_distribution(self.options.distribution),
                    self.platform,
                    &embedded,
                )?;
            }
            (None, None) => {
                return Err(Error::MissingCredentials(
                    "no provisioning profile and no developer account".into(),
                ))
            }
        }
        Ok(())
    }
}

fn remove_watch_placeholders(main_app: &Path) -> Result<()> {
    for name in WATCH_PLACEHOLDERS {
        let dir = main_app.join(name);
        if dir.exists() {
            tracing::info!(path = %dir.display(), "removing watch placeholder");
            fs::remove_dir_all(&dir)?;
        }
    }
    Ok(())
}
