//! Error types for the re-signing pipeline.
//!
//! This module defines the [`enum@Error`] enum covering every fatal failure
//! of a run: configuration problems, external tool failures, identifier
//! table violations and remote service errors.
//!
//! Non-fatal conditions (an identifier whose length prevents a clean patch,
//! a component whose entitlements cannot be dumped, a provisioning profile
//! whose application identifier does not match) are never returned as
//! errors. They are reported as `tracing` warnings at the point where the
//! fallback is taken.
//!
//! # See Also
//!
//! - [`crate::Result`] - Convenience type alias using this error

use std::path::PathBuf;
use thiserror::Error;

/// Error type for re-signing operations.
///
/// All public functions in this crate return [`crate::Result<T>`], which uses this error type.
///
/// # Examples
///
/// ```no_run
/// use resign::{Error, SignOptions, Signer};
///
/// let options = SignOptions::new("/tmp/extracted", "Apple Development: Jane (ABCDE12345)");
/// match Signer::new(options).and_then(|mut s| s.sign()) {
///     Ok(report) => println!("Signed as {}", report.main_bundle_id),
///     Err(Error::Config(msg)) => eprintln!("Bad configuration: {msg}"),
///     Err(Error::ExternalTool { command, status, .. }) => {
///         eprintln!("{command} exited with {status:?}")
///     }
///     Err(e) => eprintln!("Other error: {e}"),
/// }
/// ```
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid pipeline configuration.
    ///
    /// Raised before any external work is attempted, e.g. when the extracted
    /// tree holds no `.app` bundle or a distribution identity is paired with
    /// a macOS app.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Required credentials were not supplied.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// An external process exited unsuccessfully.
    ///
    /// Covers the signing tool, the keychain tool and the registration tool.
    /// `status` is `None` when the process was terminated by a signal.
    #[error("{command} failed with status {status:?}: {stderr}")]
    ExternalTool {
        command: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// An identifier was registered twice with different replacements.
    #[error("identifier {original} is already mapped to {existing}, refusing {requested}")]
    MappingConflict {
        original: String,
        existing: String,
        requested: String,
    },

    /// Invalid or malformed provisioning profile.
    #[error("Invalid provisioning profile: {0}")]
    ProvisioningProfile(String),

    /// A bundle is missing its metadata descriptor or required keys.
    #[error("Invalid bundle {path}: {reason}")]
    Bundle { path: PathBuf, reason: String },

    /// Property list parsing or serialization failed.
    #[error("Plist error: {0}")]
    Plist(#[from] plist::Error),

    /// ZIP archive operation failed.
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Directory traversal failed.
    #[error("Walk error: {0}")]
    Walk(#[from] walkdir::Error),

    /// The remote coordination service rejected a call.
    #[error("Remote call {endpoint} failed: {message}")]
    Remote { endpoint: String, message: String },

    /// HTTP transport failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A blocking operation did not finish in time.
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether this error belongs to the configuration class, which aborts
    /// before any remote or external work is attempted.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Config(_) | Error::MissingCredentials(_))
    }
}
