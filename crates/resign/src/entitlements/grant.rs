//! Typed capability grants.
//!
//! A freshly generated grant may only contain platform-recognized keys, so
//! it is keyed by [`EntitlementKey`] rather than by free-form strings. A
//! grant inherited verbatim from a provisioning profile is kept as the raw
//! dictionary it came from.

use crate::platform::Platform;
use crate::Result;
use plist::{Dictionary, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Allow-listed entitlement keys for generated grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntitlementKey {
    ApplicationIdentifier,
    TeamIdentifier,
    HealthKit,
    HealthKitAccess,
    HomeKit,
    WirelessAccessoryConfiguration,
    ApplicationGroups,
    InterAppAudio,
    GetTaskAllow,
    KeychainAccessGroups,
    ApsEnvironment,
    IcloudDevelopmentContainerIdentifiers,
    IcloudContainerEnvironment,
    IcloudContainerIdentifiers,
    IcloudServices,
    ExtendedVirtualAddressing,
    NetworkingMultipath,
    NetworkExtension,
    PersonalVpn,
    WifiInfo,
    NfcReaderSessionFormats,
    Siri,
    UbiquityContainerIdentifiers,
    UbiquityKvstoreIdentifier,
    AssociatedDomains,
    // macOS only
    AppSandbox,
    PicturesReadWrite,
    AllowJit,
    AllowUnsignedExecutableMemory,
    DisableLibraryValidation,
    AudioInput,
    Bluetooth,
    Usb,
    UserSelectedReadOnly,
    UserSelectedReadWrite,
    NetworkClient,
    NetworkServer,
}

impl EntitlementKey {
    pub const ALL: [EntitlementKey; 37] = [
        EntitlementKey::ApplicationIdentifier,
        EntitlementKey::TeamIdentifier,
        EntitlementKey::HealthKit,
        EntitlementKey::HealthKitAccess,
        EntitlementKey::HomeKit,
        EntitlementKey::WirelessAccessoryConfiguration,
        EntitlementKey::ApplicationGroups,
        EntitlementKey::InterAppAudio,
        EntitlementKey::GetTaskAllow,
        EntitlementKey::KeychainAccessGroups,
        EntitlementKey::ApsEnvironment,
        EntitlementKey::IcloudDevelopmentContainerIdentifiers,
        EntitlementKey::IcloudContainerEnvironment,
        EntitlementKey::IcloudContainerIdentifiers,
        EntitlementKey::IcloudServices,
        EntitlementKey::ExtendedVirtualAddressing,
        EntitlementKey::NetworkingMultipath,
        EntitlementKey::NetworkExtension,
        EntitlementKey::PersonalVpn,
        EntitlementKey::WifiInfo,
        EntitlementKey::NfcReaderSessionFormats,
        EntitlementKey::Siri,
        EntitlementKey::UbiquityContainerIdentifiers,
        EntitlementKey::UbiquityKvstoreIdentifier,
        EntitlementKey::AssociatedDomains,
        EntitlementKey::AppSandbox,
        EntitlementKey::PicturesReadWrite,
        EntitlementKey::AllowJit,
        EntitlementKey::AllowUnsignedExecutableMemory,
        EntitlementKey::DisableLibraryValidation,
        EntitlementKey::AudioInput,
        EntitlementKey::Bluetooth,
        EntitlementKey::Usb,
        EntitlementKey::UserSelectedReadOnly,
        EntitlementKey::UserSelectedReadWrite,
        EntitlementKey::NetworkClient,
        EntitlementKey::NetworkServer,
    ];

    /// Key name as it appears in an entitlements plist on `platform`.
    pub fn name(self, platform: Platform) -> &'static str {
        use EntitlementKey::*;
        match self {
            ApplicationIdentifier => platform.application_identifier_key(),
            ApsEnvironment => platform.aps_environment_key(),
            TeamIdentifier => "com.apple.developer.team-identifier",
            HealthKit => "com.apple.developer.healthkit",
            HealthKitAccess => "com.apple.developer.healthkit.access",
            HomeKit => "com.apple.developer.homekit",
            WirelessAccessoryConfiguration => "com.apple.external-accessory.wireless-configuration",
            ApplicationGroups => "com.apple.security.application-groups",
            InterAppAudio => "inter-app-audio",
            GetTaskAllow => "get-task-allow",
            KeychainAccessGroups => "keychain-access-groups",
            IcloudDevelopmentContainerIdentifiers => {
                "com.apple.developer.icloud-container-development-container-identifiers"
            }
            IcloudContainerEnvironment => "com.apple.developer.icloud-container-environment",
            IcloudContainerIdentifiers => "com.apple.developer.icloud-container-identifiers",
            IcloudServices => "com.apple.developer.icloud-services",
            ExtendedVirtualAddressing => "com.apple.developer.kernel.extended-virtual-addressing",
            NetworkingMultipath => "com.apple.developer.networking.multipath",
            NetworkExtension => "com.apple.developer.networking.networkextension",
            PersonalVpn => "com.apple.developer.networking.vpn.api",
            WifiInfo => "com.apple.developer.networking.wifi-info",
            NfcReaderSessionFormats => "com.apple.developer.nfc.readersession.formats",
            Siri => "com.apple.developer.siri",
            UbiquityContainerIdentifiers => "com.apple.developer.ubiquity-container-identifiers",
            UbiquityKvstoreIdentifier => "com.apple.developer.ubiquity-kvstore-identifier",
            AssociatedDomains => "com.apple.developer.associated-domains",
            AppSandbox => "com.apple.security.app-sandbox",
            PicturesReadWrite => "com.apple.security.assets.pictures.read-write",
            AllowJit => "com.apple.security.cs.allow-jit",
            AllowUnsignedExecutableMemory => "com.apple.security.cs.allow-unsigned-executable-memory",
            DisableLibraryValidation => "com.apple.security.cs.disable-library-validation",
            AudioInput => "com.apple.security.device.audio-input",
            Bluetooth => "com.apple.security.device.bluetooth",
            Usb => "com.apple.security.device.usb",
            UserSelectedReadOnly => "com.apple.security.files.user-selected.read-only",
            UserSelectedReadWrite => "com.apple.security.files.user-selected.read-write",
            NetworkClient => "com.apple.security.network.client",
            NetworkServer => "com.apple.security.network.server",
        }
    }

    /// Looks up an allow-listed key by its name on `platform`.
    pub fn parse(name: &str, platform: Platform) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.name(platform) == name)
    }
}

/// Entitlement value shapes accepted in generated grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntitlementValue {
    Bool(bool),
    String(String),
    List(Vec<String>),
}

impl EntitlementValue {
    /// Converts a plist value, rejecting shapes other than boolean, string
    /// and array of strings.
    pub fn from_plist(value: &Value) -> Option<Self> {
        match value {
            Value::Boolean(b) => Some(EntitlementValue::Bool(*b)),
            Value::String(s) => Some(EntitlementValue::String(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_string().map(str::to_string))
                .collect::<Option<Vec<_>>>()
                .map(EntitlementValue::List),
            _ => None,
        }
    }

    pub fn to_plist(&self) -> Value {
        match self {
            EntitlementValue::Bool(b) => Value::Boolean(*b),
            EntitlementValue::String(s) => Value::String(s.clone()),
            EntitlementValue::List(items) => {
                Value::Array(items.iter().cloned().map(Value::String).collect())
            }
        }
    }

    /// String or list contents as a list of identifiers.
    pub fn identifiers(&self) -> Vec<String> {
        match self {
            EntitlementValue::Bool(_) => Vec::new(),
            EntitlementValue::String(s) => vec![s.clone()],
            EntitlementValue::List(items) => items.clone(),
        }
    }
}

/// Grant built from scratch, constrained to [`EntitlementKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedGrant {
    platform: Platform,
    entries: BTreeMap<EntitlementKey, EntitlementValue>,
}

impl GeneratedGrant {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            entries: BTreeMap::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn get(&self, key: EntitlementKey) -> Option<&EntitlementValue> {
        self.entries.get(&key)
    }

    pub fn contains(&self, key: EntitlementKey) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn insert(&mut self, key: EntitlementKey, value: EntitlementValue) {
        self.entries.insert(key, value);
    }

    pub fn remove(&mut self, key: EntitlementKey) -> Option<EntitlementValue> {
        self.entries.remove(&key)
    }

    pub fn keys(&self) -> impl Iterator<Item = EntitlementKey> + '_ {
        self.entries.keys().copied()
    }
}

/// Final entitlement set of a primary component.
#[derive(Debug, Clone, PartialEq)]
pub enum CapabilityGrant {
    Generated(GeneratedGrant),
    /// Taken from a provisioning profile, unconstrained.
    Inherited(Dictionary),
}

impl CapabilityGrant {
    /// Plist dictionary handed to the signing tool.
    pub fn to_dictionary(&self) -> Dictionary {
        match self {
            CapabilityGrant::Generated(grant) => grant
                .entries
                .iter()
                .map(|(key, value)| (key.name(grant.platform).to_string(), value.to_plist()))
                .collect(),
            CapabilityGrant::Inherited(dict) => dict.clone(),
        }
    }

    /// Key names present in the grant.
    pub fn key_names(&self) -> Vec<String> {
        match self {
            CapabilityGrant::Generated(grant) => grant
                .keys()
                .map(|k| k.name(grant.platform).to_string())
                .collect(),
            CapabilityGrant::Inherited(dict) => dict.keys().cloned().collect(),
        }
    }

    /// String or list value of `name` as identifiers; empty for other shapes.
    pub fn identifiers(&self, name: &str) -> Vec<String> {
        match self {
            CapabilityGrant::Generated(grant) => EntitlementKey::parse(name, grant.platform)
                .and_then(|key| grant.get(key))
                .map(EntitlementValue::identifiers)
                .unwrap_or_default(),
            CapabilityGrant::Inherited(dict) => dict
                .get(name)
                .and_then(EntitlementValue::from_plist)
                .map(|v| v.identifiers())
                .unwrap_or_default(),
        }
    }

    pub fn get_task_allow(&self) -> Option<bool> {
        match self {
            CapabilityGrant::Generated(grant) => match grant.get(EntitlementKey::GetTaskAllow) {
                Some(EntitlementValue::Bool(b)) => Some(*b),
                _ => None,
            },
            CapabilityGrant::Inherited(dict) => dict
                .get(EntitlementKey::GetTaskAllow.name(Platform::Ios))
                .and_then(Value::as_boolean),
        }
    }

    /// Forces debugging on, or strips the key entirely.
    pub fn set_debuggable(&mut self, enabled: bool) {
        let name = EntitlementKey::GetTaskAllow.name(Platform::Ios);
        match (self, enabled) {
            (CapabilityGrant::Generated(grant), true) => {
                grant.insert(EntitlementKey::GetTaskAllow, EntitlementValue::Bool(true))
            }
            (CapabilityGrant::Generated(grant), false) => {
                grant.remove(EntitlementKey::GetTaskAllow);
            }
            (CapabilityGrant::Inherited(dict), true) => {
                dict.insert(name.into(), Value::Boolean(true));
            }
            (CapabilityGrant::Inherited(dict), false) => {
                dict.remove(name);
            }
        }
    }

    /// Writes the grant as an XML entitlements plist.
    pub fn write_xml(&self, path: &Path) -> Result<()> {
        Value::Dictionary(self.to_dictionary()).to_file_xml(path)?;
        Ok(())
    }
}
