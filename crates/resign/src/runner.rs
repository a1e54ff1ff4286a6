//! Batch job runner.
//!
//! One invocation processes one job of the coordination service: fetch the
//! job, set up the signing identity, download and extract the unsigned
//! archive, sign it, repack, upload and report completion. Any fatal error
//! removes the temporary keychain and reports the failure before it is
//! returned.

use crate::ids::{BundleIdRequest, IdentifierStore};
use crate::ipa::{extract_archive, pack_tree, Compression};
use crate::keychain::{select_identity, IdentityStore};
use crate::pipeline::{SignOptions, SignReport, Signer};
use crate::portal::{Fastlane, PortalAccount, Provisioner, TwoFactorSource};
use crate::progress::Progress;
use crate::remote::{AccountData, CertificateInfo, JobInfo, RemoteClient};
use crate::sign::{CodeSigner, Codesign};
use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::SecretString;
use std::fs;
use std::path::{Path, PathBuf};

/// Calls the runner makes on the coordination service.
pub trait JobService: Progress + IdentifierStore + TwoFactorSource {
    fn fetch_job(&self) -> Result<JobInfo>;
    fn certificate(&self, account_id: &str) -> Result<Option<CertificateInfo>>;
    fn store_certificate(&self, account_id: &str, team_id: &str, data: &str) -> Result<()>;
    fn store_capabilities(&self, account_id: &str, report: &SignReport) -> Result<()>;
    fn download(&self, url: &str, dest: &Path) -> Result<u64>;
    /// Uploads the signed archive and returns its storage key.
    fn upload(&self, path: &Path) -> Result<String>;
    fn complete_job(&self, output_path: &str, file_size: u64) -> Result<()>;
    fn fail_job(&self, message: &str, details: &str) -> Result<()>;
}

impl JobService for RemoteClient {
    fn fetch_job(&self) -> Result<JobInfo> {
        RemoteClient::fetch_job(self)
    }

    fn certificate(&self, account_id: &str) -> Result<Option<CertificateInfo>> {
        RemoteClient::certificate(self, account_id)
    }

    fn store_certificate(&self, account_id: &str, team_id: &str, data: &str) -> Result<()> {
        RemoteClient::store_certificate(self, account_id, team_id, data)
    }

    fn store_capabilities(&self, account_id: &str, report: &SignReport) -> Result<()> {
        RemoteClient::store_capabilities(
            self,
            account_id,
            &report.original_bundle_id,
            &report.capabilities,
            &report.original_entitlements,
        )
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        RemoteClient::download(self, url, dest)
    }

    fn upload(&self, path: &Path) -> Result<String> {
        RemoteClient::upload(self, path)
    }

    fn complete_job(&self, output_path: &str, file_size: u64) -> Result<()> {
        RemoteClient::complete_job(self, output_path, file_size)
    }

    fn fail_job(&self, message: &str, details: &str) -> Result<()> {
        RemoteClient::fail_job(self, message, details)
    }
}

/// Builds the external tools a run signs and provisions with.
pub trait Toolchain {
    fn code_signer(&self, identity: &str, keychain: Option<&Path>) -> Box<dyn CodeSigner>;

    fn provisioner<'s>(
        &self,
        account: PortalAccount,
        two_factor: &'s dyn TwoFactorSource,
    ) -> Box<dyn Provisioner + 's>;
}

/// `codesign` and `fastlane`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AppleToolchain;

impl Toolchain for AppleToolchain {
    fn code_signer(&self, identity: &str, keychain: Option<&Path>) -> Box<dyn CodeSigner> {
        let codesign = Codesign::new(identity);
        match keychain {
            Some(path) => Box::new(codesign.keychain(path)),
            None => Box::new(codesign),
        }
    }

    fn provisioner<'s>(
        &self,
        account: PortalAccount,
        two_factor: &'s dyn TwoFactorSource,
    ) -> Box<dyn Provisioner + 's> {
        Box::new(Fastlane::new(account).two_factor(two_factor))
    }
}

/// Local settings of the runner.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Holds the downloaded, extracted and signed files.
    pub work_dir: PathBuf,
    /// Local PKCS#12 bundle; fetched from the service when missing.
    pub certificate: PathBuf,
    pub certificate_password: SecretString,
    /// Used instead of portal provisioning when the file exists.
    pub provisioning_profile: PathBuf,
    pub mapper_secret: String,
    pub compression: Compression,
}

impl RunnerConfig {
    /// Defaults to `cert.p12` and `prov.mobileprovision` inside `work_dir`.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        certificate_password: SecretString,
        mapper_secret: impl Into<String>,
    ) -> Self {
        let work_dir = work_dir.into();
        Self {
            certificate: work_dir.join("cert.p12"),
            provisioning_profile: work_dir.join("prov.mobileprovision"),
            work_dir,
            certificate_password,
            mapper_secret: mapper_secret.into(),
            compression: Compression::default(),
        }
    }
}

/// Result of a successful job.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub report: SignReport,
    pub output: PathBuf,
    pub file_key: String,
    pub file_size: u64,
}

struct Credentials {
    p12: PathBuf,
    team_id: String,
}

/// Runs one job end to end.
pub struct JobRunner<'a, S, T> {
    service: &'a S,
    toolchain: T,
    identities: Box<dyn IdentityStore + 'a>,
    config: RunnerConfig,
}

impl<'a, S: JobService, T: Toolchain> JobRunner<'a, S, T> {
    pub fn new(
        service: &'a S,
        toolchain: T,
        identities: impl IdentityStore + 'a,
        config: RunnerConfig,
    ) -> Self {
        Self {
            service,
            toolchain,
            identities: Box::new(identities),
            config,
        }
    }

    /// Processes the job.
    ///
    /// The identity store is removed whatever the outcome. On failure the
    /// error is reported to the service and then returned.
    pub fn run(&mut self) -> Result<JobOutcome> {
        let result = self.execute();

        tracing::info!("cleaning up");
        if let Err(e) = self.identities.remove() {
            tracing::warn!(error = %e, "failed to remove keychain");
        }

        if let Err(e) = &result {
            tracing::error!(error = %e, "job failed");
            if let Err(report) = self.service.fail_job(&e.to_string(), &format!("{e:?}")) {
                tracing::warn!(error = %report, "failed to report job failure");
            }
        }
        result
    }

    fn execute(&mut self) -> Result<JobOutcome> {
        let info = self.service.fetch_job()?;
        tracing::info!(job_type = %info.job.job_type, "job data received");
        let progress: &dyn Progress = self.service;
        progress.report(5, "Initializing job");

        fs::create_dir_all(&self.config.work_dir)?;
        progress.report(10, "Setting up keychain");
        let credentials = self.credentials(&info.account)?;
        let names = self
            .identities
            .import(&credentials.p12, &self.config.certificate_password)?;
        let (identity, distribution) = select_identity(&names)?;
        progress.report(15, "Certificate validation completed");

        let account = &info.account;
        if account.email.is_empty() || account.password.is_empty() {
            return Err(Error::MissingCredentials(
                "developer account information missing from job data".into(),
            ));
        }

        let unsigned = self.config.work_dir.join("unsigned.ipa");
        tracing::info!(url = %info.job.input_path, "downloading app");
        self.service.download(&info.job.input_path, &unsigned)?;

        progress.report(20, "Extracting IPA");
        let extracted = tempfile::Builder::new()
            .prefix("extracted")
            .tempdir_in(&self.config.work_dir)?;
        extract_archive(&unsigned, extracted.path())?;

        progress.report(30, "Starting signing process");
        let mut options = SignOptions::new(extracted.path(), identity.clone())
            .distribution(distribution)
            .team_id(credentials.team_id.clone())
            .account(account.email.clone(), account.password.clone())
            .bundle_id(BundleIdRequest::from_option(
                info.job.bundle_id.as_deref().filter(|id| !id.is_empty()),
            ))
            .patch_all_devices(true)
            .encode_ids(true)
            .mapper_secret(self.config.mapper_secret.clone());
        if self.config.provisioning_profile.is_file() {
            options = options.provisioning_profile(&self.config.provisioning_profile);
        }
        if let Some(name) = info.job.bundle_name.as_deref().filter(|n| !n.is_empty()) {
            options = options.display_name(name);
        }

        let portal_account = PortalAccount {
            name: account.email.clone(),
            password: SecretString::from(account.password.clone()),
            team_id: credentials.team_id.clone(),
        };
        let report = Signer::new(options)?
            .code_signer(self.toolchain.code_signer(&identity, self.identities.keychain()))
            .provisioner(self.toolchain.provisioner(portal_account, self.service))
            .identifier_store(self.service)
            .progress(self.service)
            .sign()?;
        report_capabilities(self.service, account, &report);

        progress.report(85, "Signing completed, packaging app");
        let output = self.config.work_dir.join("signed.ipa");
        pack_tree(extracted.path(), &output, self.config.compression)?;
        drop(extracted);

        progress.report(90, "Uploading signed IPA");
        let file_size = fs::metadata(&output)?.len();
        let file_key = self.service.upload(&output)?;
        self.service.complete_job(&file_key, file_size)?;
        progress.report(100, "Job completed successfully");

        Ok(JobOutcome {
            report,
            output,
            file_key,
            file_size,
        })
    }

    /// Finds the signing certificate: the local file if present (mirrored to
    /// the service best-effort), otherwise the one stored for the account.
    fn credentials(&self, account: &AccountData) -> Result<Credentials> {
        let local = &self.config.certificate;
        if local.is_file() {
            if let Some(account_id) = account.id.as_deref() {
                let data = STANDARD.encode(fs::read(local)?);
                if let Err(e) = self
                    .service
                    .store_certificate(account_id, &account.team_id, &data)
                {
                    tracing::warn!(error = %e, "failed to store certificate");
                }
            }
            return Ok(Credentials {
                p12: local.clone(),
                team_id: account.team_id.clone(),
            });
        }

        let account_id = account.id.as_deref().ok_or_else(|| {
            Error::MissingCredentials("no certificate file and no account to fetch one for".into())
        })?;
        let stored = self.service.certificate(account_id)?.ok_or_else(|| {
            Error::MissingCredentials(format!("no certificate stored for account {account_id}"))
        })?;
        let bytes = STANDARD
            .decode(stored.certificate_data.trim())
            .map_err(|e| Error::MissingCredentials(format!("certificate data is not base64: {e}")))?;
        fs::write(local, bytes)?;
        tracing::info!(account_id, "fetched certificate");

        let team_id = match stored.team_id {
            Some(team) if account.team_id.is_empty() => team,
            _ => account.team_id.clone(),
        };
        if team_id.is_empty() {
            return Err(Error::MissingCredentials("no team id for account".into()));
        }
        Ok(Credentials {
            p12: local.clone(),
            team_id,
        })
    }
}

/// Shares what the app uses with the service. Never fails the job.
fn report_capabilities<S: JobService + ?Sized>(
    service: &S,
    account: &AccountData,
    report: &SignReport,
) {
    let Some(account_id) = account.id.as_deref().filter(|id| !id.is_empty()) else {
        return;
    };
    if report.capabilities.is_empty() {
        return;
    }
    if let Err(e) = service.store_capabilities(account_id, report) {
        tracing::warn!(error = %e, "failed to store app capabilities");
    }
}

/// Password as handed to the identity store.
pub fn certificate_password(value: Option<&str>) -> SecretString {
    SecretString::from(value.unwrap_or_default().to_string())
}
