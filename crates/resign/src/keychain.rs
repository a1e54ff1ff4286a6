//! Signing identity storage.
//!
//! The PKCS#12 bundle is imported into a keychain created for the run so
//! the signing tool can find the identity by name without touching the
//! user's login keychain.

use crate::process;
use crate::{Error, Result};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

/// Holds signing identities for the duration of a run.
pub trait IdentityStore {
    /// Imports a PKCS#12 bundle and returns the display names of every
    /// usable signing identity.
    fn import(&mut self, p12: &Path, password: &SecretString) -> Result<Vec<String>>;

    /// Deletes the store. Called once at the end of the run.
    fn remove(&mut self) -> Result<()>;

    /// Keychain the signing tool should search, if not the default list.
    fn keychain(&self) -> Option<&Path> {
        None
    }
}

/// Temporary keychain driven through the `security` tool.
#[derive(Debug)]
pub struct SecurityKeychain {
    path: PathBuf,
    created: bool,
}

impl SecurityKeychain {
    /// Keychain with a random name under `~/Library/Keychains`.
    pub fn temporary() -> Result<Self> {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .ok_or_else(|| Error::Config("HOME is not set".into()))?;
        Ok(Self::at(home.join("Library/Keychains").join(random_name())))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            created: false,
        }
    }

    fn user_keychains() -> Result<Vec<String>> {
        let output = process::run(Command::new("security").args(["list-keychains", "-d", "user"]))?;
        Ok(process::decode_clean(&output.stdout)
            .split_whitespace()
            .map(|k| k.trim_matches('"').to_string())
            .collect())
    }

    fn set_user_keychains(keychains: &[String]) -> Result<()> {
        process::run(
            Command::new("security")
                .args(["list-keychains", "-d", "user", "-s"])
                .args(keychains),
        )?;
        Ok(())
    }
}

impl IdentityStore for SecurityKeychain {
    fn import(&mut self, p12: &Path, password: &SecretString) -> Result<Vec<String>> {
        let keychain = self.path.to_string_lossy().into_owned();
        // Keychain and certificate share one password.
        let pass = password.expose_secret();

        if let Err(e) = process::run(Command::new("security").args(["delete-keychain", &keychain])) {
            tracing::debug!(error = %e, "no previous keychain to delete");
        }

        let mut keychains = Self::user_keychains()?;
        keychains.push(keychain.clone());

        process::run(Command::new("security").args(["create-keychain", "-p", pass, &keychain]))?;
        self.created = true;
        process::run(Command::new("security").args(["unlock-keychain", "-p", pass, &keychain]))?;
        process::run(Command::new("security").args(["set-keychain-settings", &keychain]))?;
        Self::set_user_keychains(&keychains)?;
        process::run(
            Command::new("security")
                .arg("import")
                .arg(p12)
                .args(["-P", pass, "-A", "-k", &keychain, "-f", "pkcs12"]),
        )?;
        process::run(Command::new("security").args([
            "set-key-partition-list",
            "-S",
            "apple-tool:,apple:,codesign:",
            "-s",
            "-k",
            pass,
            &keychain,
        ]))?;

        let output = process::run(Command::new("security").args([
            "find-identity",
            "-p",
            "appleID",
            "-v",
            &keychain,
        ]))?;
        let identities = parse_identities(&process::decode_clean(&output.stdout));
        tracing::info!(keychain = %keychain, count = identities.len(), "imported signing certificate");
        Ok(identities)
    }

    fn remove(&mut self) -> Result<()> {
        if !self.created {
            return Ok(());
        }
        let keychain = self.path.to_string_lossy().into_owned();
        let remaining: Vec<String> = Self::user_keychains()?
            .into_iter()
            .filter(|k| !k.contains(keychain.as_str()))
            .collect();
        Self::set_user_keychains(&remaining)?;
        process::run(Command::new("security").args(["delete-keychain", &keychain]))?;
        self.created = false;
        tracing::info!(keychain = %keychain, "removed keychain");
        Ok(())
    }

    fn keychain(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Extracts the quoted identity names from `security find-identity` output.
pub fn parse_identities(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let start = line.find('"')?;
            let end = line.rfind('"')?;
            (end > start).then(|| line[start + 1..end].to_string())
        })
        .collect()
}

/// Picks the identity to sign with: distribution before development.
///
/// Returns the name and whether it is a distribution identity.
pub fn select_identity(names: &[String]) -> Result<(String, bool)> {
    if names.is_empty() {
        return Err(Error::Config(
            "No valid code signing certificate found".into(),
        ));
    }
    if let Some(name) = names.iter().find(|n| n.contains("Distribution")) {
        tracing::info!(identity = %name, "using distribution certificate");
        return Ok((name.clone(), true));
    }
    if let Some(name) = names.iter().find(|n| n.contains("Develop")) {
        tracing::info!(identity = %name, "using development certificate");
        return Ok((name.clone(), false));
    }
    Err(Error::Config("Unrecognized code signing certificate".into()))
}

fn random_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(nanos.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    let suffix: String = digest[..4].iter().map(|b| format!("{b:02x}")).collect();
    format!("resign-{suffix}.keychain-db")
}
