//! External signing tool contract.

use crate::process::{self, RunningProcess};
use crate::Result;
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};
use std::process::Command;

/// An in-flight signing operation.
pub trait SigningHandle: Send {
    /// Blocks until the operation finishes; a failed exit is an error.
    fn wait(self: Box<Self>) -> Result<()>;
}

impl SigningHandle for RunningProcess {
    fn wait(self: Box<Self>) -> Result<()> {
        RunningProcess::wait(*self).map(|_| ())
    }
}

/// Signs bundle components with a fixed identity.
pub trait CodeSigner {
    /// Starts signing `path` without waiting for it.
    ///
    /// Without `entitlements` the component keeps the entitlements it is
    /// already signed with.
    fn launch(&self, path: &Path, entitlements: Option<&Path>) -> Result<Box<dyn SigningHandle>>;

    /// Reads the entitlements `path` is currently signed with.
    fn dump_entitlements(&self, path: &Path) -> Result<Dictionary>;
}

impl<T: CodeSigner + ?Sized> CodeSigner for Box<T> {
    fn launch(&self, path: &Path, entitlements: Option<&Path>) -> Result<Box<dyn SigningHandle>> {
        (**self).launch(path, entitlements)
    }

    fn dump_entitlements(&self, path: &Path) -> Result<Dictionary> {
        (**self).dump_entitlements(path)
    }
}

/// `codesign` command line tool.
#[derive(Debug, Clone)]
pub struct Codesign {
    identity: String,
    keychain: Option<PathBuf>,
}

impl Codesign {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            keychain: None,
        }
    }

    /// Looks the identity up in this keychain only.
    pub fn keychain(mut self, keychain: impl Into<PathBuf>) -> Self {
        self.keychain = Some(keychain.into());
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn sign_command(&self, path: &Path, entitlements: Option<&Path>) -> Command {
        let mut cmd = Command::new("codesign");
        cmd.args(["--continue", "-f", "--no-strict", "-s", &self.identity]);
        if let Some(keychain) = &self.keychain {
            cmd.arg("--keychain").arg(keychain);
        }
        if let Some(entitlements) = entitlements {
            cmd.arg("--entitlements").arg(entitlements);
        }
        cmd.arg(path);
        cmd
    }
}

impl CodeSigner for Codesign {
    fn launch(&self, path: &Path, entitlements: Option<&Path>) -> Result<Box<dyn SigningHandle>> {
        let handle = process::spawn(&mut self.sign_command(path, entitlements))?;
        Ok(Box::new(handle))
    }

    fn dump_entitlements(&self, path: &Path) -> Result<Dictionary> {
        let output = process::run(
            Command::new("codesign")
                .args(["--no-strict", "-d", "--entitlements", "-", "--xml"])
                .arg(path),
        )?;
        parse_entitlements(&output.stdout)
    }
}

/// Parses the entitlements printed by the signing tool; no output means
/// no entitlements.
pub fn parse_entitlements(stdout: &[u8]) -> Result<Dictionary> {
    let text = process::decode_clean(stdout);
    if text.is_empty() {
        return Ok(Dictionary::new());
    }
    let value: Value = plist::from_bytes(text.as_bytes())?;
    Ok(value.into_dictionary().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_command_line() {
        let tool = Codesign::new("Apple Development: Jane (ABCDE12345)").keychain("/tmp/k.keychain");
        let cmd = tool.sign_command(Path::new("/x/A.app"), Some(Path::new("/t/e.plist")));
        assert_eq!(
            process::describe(&cmd),
            "codesign --continue -f --no-strict -s Apple Development: Jane (ABCDE12345) \
             --keychain /tmp/k.keychain --entitlements /t/e.plist /x/A.app"
        );
    }

    #[test]
    fn test_secondary_has_no_entitlements_flag() {
        let cmd = Codesign::new("id").sign_command(Path::new("/x/F.framework"), None);
        assert!(!process::describe(&cmd).contains("--entitlements"));
    }

    #[test]
    fn test_parse_entitlements() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict><key>get-task-allow</key><true/></dict></plist>
"#;
        let dict = parse_entitlements(xml).unwrap();
        assert_eq!(dict.get("get-task-allow").and_then(Value::as_boolean), Some(true));
        assert!(parse_entitlements(b"  \n").unwrap().is_empty());
    }
}
