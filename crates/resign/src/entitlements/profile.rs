//! Provisioning profile parsing.
//!
//! A `.mobileprovision` / `.provisionprofile` file is a CMS envelope around
//! an XML property list. The plist is located by its text markers rather
//! than by decoding the envelope, which is all the pipeline needs.

use crate::platform::Platform;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::path::{Path, PathBuf};

/// Parsed provisioning profile.
#[derive(Debug, Clone)]
pub struct ProvisioningProfile {
    path: PathBuf,
    name: Option<String>,
    team_ids: Vec<String>,
    entitlements: Dictionary,
}

impl ProvisioningProfile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let mut profile = Self::parse(&data)?;
        profile.path = path.to_path_buf();
        Ok(profile)
    }

    /// Parses raw profile bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let plist = embedded_plist(data)?;
        let value: Value = plist::from_bytes(plist)
            .map_err(|e| Error::ProvisioningProfile(format!("Failed to parse plist: {e}")))?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| Error::ProvisioningProfile("Profile is not a dictionary".into()))?;

        let entitlements = dict
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .cloned()
            .ok_or_else(|| Error::ProvisioningProfile("No Entitlements in profile".into()))?;
        let team_ids = dict
            .get("TeamIdentifier")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_string)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            path: PathBuf::new(),
            name: dict.get("Name").and_then(Value::as_string).map(str::to_string),
            team_ids,
            entitlements,
        })
    }

    /// File the profile was loaded from; empty when parsed from memory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn team_ids(&self) -> &[String] {
        &self.team_ids
    }

    pub fn entitlements(&self) -> &Dictionary {
        &self.entitlements
    }

    /// `TEAM.bundle-id` (or `TEAM.*`) the profile was issued for.
    pub fn application_identifier(&self, platform: Platform) -> Option<&str> {
        self.entitlements
            .get(platform.application_identifier_key())
            .and_then(Value::as_string)
    }
}

fn embedded_plist(data: &[u8]) -> Result<&[u8]> {
    let start = data
        .windows(5)
        .position(|w| w == b"<?xml")
        .ok_or_else(|| Error::ProvisioningProfile("No plist found in profile".into()))?;
    let end = data[start..]
        .windows(8)
        .rposition(|w| w == b"</plist>")
        .map(|p| start + p + 8)
        .ok_or_else(|| Error::ProvisioningProfile("Invalid plist in profile".into()))?;
    Ok(&data[start..end])
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const WILDCARD_PROFILE: &[u8] = br#"CMS_HEADER<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Name</key>
    <string>Wildcard Dev</string>
    <key>TeamIdentifier</key>
    <array><string>NEWTEAM123</string></array>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key>
        <string>NEWTEAM123.*</string>
        <key>keychain-access-groups</key>
        <array><string>NEWTEAM123.*</string></array>
        <key>get-task-allow</key>
        <true/>
        <key>com.apple.developer.team-identifier</key>
        <string>NEWTEAM123</string>
    </dict>
</dict>
</plist>
CMS_SIGNATURE"#;

    #[test]
    fn test_parse_profile() {
        let profile = ProvisioningProfile::parse(WILDCARD_PROFILE).unwrap();
        assert_eq!(profile.name(), Some("Wildcard Dev"));
        assert_eq!(profile.team_ids(), &["NEWTEAM123".to_string()]);
        assert_eq!(profile.application_identifier(Platform::Ios), Some("NEWTEAM123.*"));
        assert_eq!(profile.application_identifier(Platform::Macos), None);
        assert!(profile.entitlements().contains_key("keychain-access-groups"));
    }

    #[test]
    fn test_parse_without_plist() {
        let err = ProvisioningProfile::parse(b"just some random data").unwrap_err();
        assert!(matches!(err, Error::ProvisioningProfile(_)));
    }

    #[test]
    fn test_parse_without_end_tag() {
        let err = ProvisioningProfile::parse(b"<?xml version=\"1.0\"?><plist><dict>").unwrap_err();
        assert!(matches!(err, Error::ProvisioningProfile(_)));
    }

    #[test]
    fn test_parse_without_entitlements() {
        let data = br#"<?xml version="1.0"?><plist><dict><key>Name</key><string>x</string></dict></plist>"#;
        let err = ProvisioningProfile::parse(data).unwrap_err();
        assert!(err.to_string().contains("Entitlements"));
    }
}
