//! Command-line interface for the bundle re-signing pipeline.
//!
//! Usage:
//!   resign sign <APP_DIR|IPA> -s <IDENTITY> ...   # sign locally
//!   resign job                                     # process one remote job

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use resign::ids::BundleIdRequest;
use resign::ipa::{extract_archive, pack_tree, Compression};
use resign::keychain::SecurityKeychain;
use resign::remote::{RemoteClient, RemoteConfig};
use resign::runner::{certificate_password, AppleToolchain};
use resign::{JobRunner, RunnerConfig, SignOptions, Signer};
use secrecy::SecretString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "resign")]
#[command(about = "Re-sign application bundles under a new identity", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign an extracted bundle tree or an IPA file
    Sign(Box<SignArgs>),

    /// Process one job from the coordination service
    Job(JobArgs),
}

#[derive(Args)]
struct SignArgs {
    /// Extracted tree containing a .app bundle, or an .ipa file
    input: PathBuf,

    /// Output IPA (IPA input only, default: <input>.signed.ipa)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Signing identity name as shown by `security find-identity`
    #[arg(short = 's', long)]
    identity: String,

    /// Keychain holding the identity
    #[arg(long)]
    keychain: Option<PathBuf>,

    /// Team identifier of the signing account
    #[arg(short = 't', long)]
    team_id: Option<String>,

    /// Developer account used for portal registration
    #[arg(long, env = "ACCOUNT_NAME")]
    account: Option<String>,

    /// Developer account password
    #[arg(long, env = "ACCOUNT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Provisioning profile to embed instead of issuing new ones
    #[arg(short = 'm', long)]
    profile: Option<PathBuf>,

    /// Main bundle id; pass an empty string to take it from the profile
    #[arg(short = 'b', long)]
    bundle_id: Option<String>,

    /// Display name of the main bundle
    #[arg(short = 'n', long)]
    display_name: Option<String>,

    /// Sign for distribution (default: derived from the identity name)
    #[arg(long)]
    distribution: Option<bool>,

    /// Strip get-task-allow instead of forcing it on
    #[arg(long)]
    no_debug: bool,

    /// Enable all device families and lower the minimum OS version
    #[arg(long)]
    all_devices: bool,

    /// Relax orientation rules for running on Apple silicon Macs
    #[arg(long)]
    mac: bool,

    /// Enable file sharing
    #[arg(long)]
    file_sharing: bool,

    /// Replace identifiers with derived ones
    #[arg(short = 'e', long)]
    encode_ids: bool,

    /// Patch identifiers inside binaries
    #[arg(long)]
    patch_ids: bool,

    /// Keep the original CFBundleIdentifier of each component
    #[arg(long)]
    force_original_id: bool,

    /// Seed for identifier derivation
    #[arg(long, env = "SECRET_KEY", hide_env_values = true, default_value = "")]
    secret: String,

    /// ZIP compression level for IPA output (0-9)
    #[arg(short = 'z', long, default_value = "6")]
    zip_level: u8,
}

#[derive(Args)]
struct JobArgs {
    #[arg(long, env = "JOB_ID")]
    job_id: String,

    #[arg(long, env = "API_TOKEN", hide_env_values = true)]
    api_token: String,

    /// Base URL of the coordination service
    #[arg(long, env = "SECRET_URL")]
    url: String,

    /// Seed for identifier derivation
    #[arg(long, env = "SECRET_KEY", hide_env_values = true)]
    secret: String,

    /// Password of the PKCS#12 certificate
    #[arg(long, env = "CERT_PASSWORD", hide_env_values = true)]
    cert_password: Option<String>,

    /// Directory for downloaded and produced files
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,

    /// Timeout of service calls, in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Sign(args) => sign(*args),
        Commands::Job(args) => job(args),
    }
}

fn sign(args: SignArgs) -> Result<()> {
    let is_ipa = args
        .input
        .extension()
        .map(|e| e.eq_ignore_ascii_case("ipa"))
        .unwrap_or(false);

    if !is_ipa {
        return sign_tree(&args, &args.input);
    }

    let work = tempfile::tempdir().context("creating work directory")?;
    extract_archive(&args.input, work.path())
        .with_context(|| format!("extracting {}", args.input.display()))?;
    sign_tree(&args, work.path())?;

    let output = args.output.clone().unwrap_or_else(|| {
        let mut out = args.input.clone();
        out.set_extension("signed.ipa");
        out
    });
    let compression = match args.zip_level {
        0 => Compression::Store,
        level => Compression::Deflate(level),
    };
    pack_tree(work.path(), &output, compression)?;
    println!("Signed: {}", output.display());
    Ok(())
}

fn sign_tree(args: &SignArgs, dir: &Path) -> Result<()> {
    let mut options = SignOptions::new(dir, args.identity.clone())
        .bundle_id(BundleIdRequest::from_option(args.bundle_id.as_deref()))
        .patch_debug(!args.no_debug)
        .patch_all_devices(args.all_devices)
        .patch_mac(args.mac)
        .patch_file_sharing(args.file_sharing)
        .encode_ids(args.encode_ids)
        .patch_ids(args.patch_ids)
        .force_original_id(args.force_original_id)
        .mapper_secret(args.secret.clone());
    if let Some(keychain) = &args.keychain {
        options = options.keychain(keychain);
    }
    if let Some(team_id) = &args.team_id {
        options = options.team_id(team_id.clone());
    }
    match (&args.account, &args.password) {
        (Some(name), Some(password)) => options = options.account(name.clone(), password.clone()),
        (None, None) => {}
        _ => bail!("--account and --password must be given together"),
    }
    if let Some(profile) = &args.profile {
        options = options.provisioning_profile(profile);
    }
    if let Some(name) = &args.display_name {
        options = options.display_name(name.clone());
    }
    if let Some(distribution) = args.distribution {
        options = options.distribution(distribution);
    }

    let progress = |percent: u8, message: &str| tracing::info!(percent, message, "progress");
    let report = Signer::new(options)?.progress(&progress).sign()?;
    println!(
        "{} -> {} ({} components, {} mappings, {} entitlements removed)",
        report.original_bundle_id,
        report.main_bundle_id,
        report.components,
        report.mappings.len(),
        report.removed_entitlements.len()
    );
    Ok(())
}

fn job(args: JobArgs) -> Result<()> {
    tracing::info!(job_id = %args.job_id, "processing job");
    let config = RemoteConfig::new(
        args.url,
        SecretString::from(args.api_token),
        args.job_id,
    )
    .timeout(Duration::from_secs(args.timeout));
    let client = RemoteClient::new(config)?;
    let keychain = SecurityKeychain::temporary()?;
    let runner_config = RunnerConfig::new(
        args.work_dir,
        certificate_password(args.cert_password.as_deref()),
        args.secret,
    );

    let outcome = JobRunner::new(&client, AppleToolchain, keychain, runner_config).run()?;
    println!(
        "Signed {} as {} ({} bytes, {})",
        outcome.report.original_bundle_id,
        outcome.report.main_bundle_id,
        outcome.file_size,
        outcome.file_key
    );
    Ok(())
}
