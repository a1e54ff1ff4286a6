//! Platform capability table.
//!
//! iOS and macOS bundles differ in a handful of entitlement key names, the
//! file name of the embedded provisioning profile and which `Info.plist`
//! patches apply. [`Platform`] is resolved once from the main bundle layout
//! and carries all of those rules.

use std::path::Path;

/// Target platform of the bundle being re-signed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ios,
    Macos,
}

impl Platform {
    /// Detects the platform from the main bundle's `Info.plist` location.
    ///
    /// macOS bundles keep their descriptor under `Contents/`.
    pub fn detect(main_info_plist: &Path) -> Self {
        let in_contents = main_info_plist
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n == "Contents")
            .unwrap_or(false);
        if in_contents {
            Platform::Macos
        } else {
            Platform::Ios
        }
    }

    pub fn is_macos(self) -> bool {
        self == Platform::Macos
    }

    /// Entitlement key holding `TEAM.bundle-id`.
    pub fn application_identifier_key(self) -> &'static str {
        match self {
            Platform::Ios => "application-identifier",
            Platform::Macos => "com.apple.application-identifier",
        }
    }

    /// Entitlement key holding the push notification environment.
    pub fn aps_environment_key(self) -> &'static str {
        match self {
            Platform::Ios => "aps-environment",
            Platform::Macos => "com.apple.developer.aps-environment",
        }
    }

    /// File name of the provisioning profile placed next to `Info.plist`.
    pub fn embedded_profile_name(self) -> &'static str {
        match self {
            Platform::Ios => "embedded.mobileprovision",
            Platform::Macos => "embedded.provisionprofile",
        }
    }

    /// Platform name understood by the profile issuing tool.
    pub fn portal_name(self) -> &'static str {
        match self {
            Platform::Ios => "ios",
            Platform::Macos => "macos",
        }
    }

    /// `Info.plist` key and value forcing the lowest supported OS version.
    pub fn minimum_version_patch(self) -> (&'static str, &'static str) {
        match self {
            Platform::Ios => ("MinimumOSVersion", "3.0"),
            Platform::Macos => ("LSMinimumSystemVersion", "10.0"),
        }
    }

    /// Whether the device-family, orientation and file-sharing patches apply.
    pub fn supports_device_patches(self) -> bool {
        self == Platform::Ios
    }
}
