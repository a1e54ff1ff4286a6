//! Capability summary of an application, reported back to the coordination
//! service for analysis.

use plist::{Dictionary, Value};
use std::collections::BTreeSet;

/// Entitlement key → capability it implies.
const ENTITLEMENT_CAPABILITIES: [(&str, &str); 29] = [
    ("aps-environment", "push_notifications"),
    ("com.apple.developer.aps-environment", "push_notifications"),
    ("com.apple.developer.healthkit", "healthkit"),
    ("com.apple.developer.healthkit.access", "healthkit"),
    ("com.apple.developer.homekit", "homekit"),
    ("com.apple.external-accessory.wireless-configuration", "wireless_accessory"),
    ("com.apple.security.application-groups", "app_groups"),
    ("inter-app-audio", "inter_app_audio"),
    ("keychain-access-groups", "keychain_sharing"),
    ("com.apple.developer.icloud-container-identifiers", "icloud"),
    ("com.apple.developer.icloud-services", "icloud"),
    ("com.apple.developer.ubiquity-container-identifiers", "icloud"),
    ("com.apple.developer.ubiquity-kvstore-identifier", "icloud"),
    ("com.apple.developer.networking.networkextension", "network_extensions"),
    ("com.apple.developer.networking.vpn.api", "personal_vpn"),
    ("com.apple.developer.networking.wifi-info", "wifi_info"),
    ("com.apple.developer.nfc.readersession.formats", "nfc_tag_reading"),
    ("com.apple.developer.siri", "sirikit"),
    ("com.apple.developer.associated-domains", "associated_domains"),
    ("com.apple.developer.networking.multipath", "multipath"),
    ("com.apple.developer.kernel.extended-virtual-addressing", "extended_virtual_addressing"),
    ("com.apple.security.app-sandbox", "app_sandbox"),
    ("com.apple.security.network.client", "network_client"),
    ("com.apple.security.network.server", "network_server"),
    ("com.apple.security.device.audio-input", "microphone"),
    ("com.apple.security.device.camera", "camera"),
    ("com.apple.security.files.user-selected.read-only", "file_access_read"),
    ("com.apple.security.files.user-selected.read-write", "file_access_write"),
    ("com.apple.developer.in-app-payments", "apple_pay"),
];

/// `UIBackgroundModes` entry → capability it implies.
const BACKGROUND_MODES: [(&str, &str); 4] = [
    ("background-fetch", "background_app_refresh"),
    ("remote-notification", "push_notifications"),
    ("background-audio", "background_audio"),
    ("location", "location_services"),
];

/// Capabilities implied by a component's original entitlements.
pub fn from_entitlements(entitlements: &Dictionary) -> BTreeSet<String> {
    ENTITLEMENT_CAPABILITIES
        .iter()
        .filter(|(key, _)| entitlements.contains_key(*key))
        .map(|(_, capability)| (*capability).to_string())
        .collect()
}

/// Capabilities visible from `Info.plist` alone, for components whose
/// entitlements could not be read.
pub fn from_info_plist(info: &Dictionary) -> BTreeSet<String> {
    let mut capabilities = BTreeSet::new();
    if let Some(modes) = info.get("UIBackgroundModes").and_then(Value::as_array) {
        for (mode, capability) in BACKGROUND_MODES {
            if modes.iter().any(|m| m.as_string() == Some(mode)) {
                capabilities.insert(capability.to_string());
            }
        }
    }
    let non_empty = |key: &str| {
        info.get(key)
            .and_then(Value::as_array)
            .map(|a| !a.is_empty())
            .unwrap_or(false)
    };
    if non_empty("CFBundleURLTypes") {
        capabilities.insert("url_schemes".into());
    }
    if non_empty("CFBundleDocumentTypes") {
        capabilities.insert("document_types".into());
    }
    capabilities
}
