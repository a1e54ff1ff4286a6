//! `Info.plist` access and patching.

use crate::platform::Platform;
use crate::{Error, Result};
use plist::{Dictionary, Value};
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Locates a bundle's metadata descriptor.
///
/// iOS bundles keep `Info.plist` at the top level, macOS bundles under
/// `Contents/`. Anything else falls back to the shortest match below the
/// bundle.
pub fn find_info_plist(bundle: &Path) -> Result<PathBuf> {
    for candidate in [bundle.join("Info.plist"), bundle.join("Contents/Info.plist")] {
        if candidate.is_file() {
            return Ok(candidate);
        }
    }
    WalkDir::new(bundle)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && e.file_name() == "Info.plist")
        .map(|e| e.into_path())
        .min_by_key(|p| p.as_os_str().len())
        .ok_or_else(|| Error::Bundle {
            path: bundle.to_path_buf(),
            reason: "Info.plist not found".into(),
        })
}

/// A loaded `Info.plist` that remembers its on-disk encoding.
#[derive(Debug, Clone)]
pub struct InfoPlist {
    path: PathBuf,
    dict: Dictionary,
    binary: bool,
}

/// `Info.plist` patches requested for primary components.
#[derive(Debug, Clone, Default)]
pub struct InfoPatches {
    pub all_devices: bool,
    pub mac_compat: bool,
    pub file_sharing: bool,
}

const ALL_ORIENTATIONS: [&str; 4] = [
    "UIInterfaceOrientationPortrait",
    "UIInterfaceOrientationPortraitUpsideDown",
    "UIInterfaceOrientationLandscapeLeft",
    "UIInterfaceOrientationLandscapeRight",
];

impl InfoPlist {
    /// Reads a binary or XML property list.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        let binary = data.starts_with(b"bplist");
        let value: Value = plist::from_reader(Cursor::new(data))?;
        let dict = value.into_dictionary().ok_or_else(|| Error::Bundle {
            path: path.to_path_buf(),
            reason: "Info.plist is not a dictionary".into(),
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            dict,
            binary,
        })
    }

    /// Writes the property list back in the encoding it was read with.
    pub fn save(&self) -> Result<()> {
        let value = Value::Dictionary(self.dict.clone());
        if self.binary {
            value.to_file_binary(&self.path)?;
        } else {
            value.to_file_xml(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn bundle_identifier(&self) -> Result<&str> {
        self.dict
            .get("CFBundleIdentifier")
            .and_then(Value::as_string)
            .ok_or_else(|| Error::Bundle {
                path: self.path.clone(),
                reason: "CFBundleIdentifier missing".into(),
            })
    }

    pub fn set_bundle_identifier(&mut self, id: &str) {
        self.dict
            .insert("CFBundleIdentifier".into(), Value::String(id.into()));
    }

    pub fn executable(&self) -> Option<&str> {
        self.dict.get("CFBundleExecutable").and_then(Value::as_string)
    }

    /// Location of the executable named by `CFBundleExecutable`.
    ///
    /// macOS bundles keep it in `Contents/MacOS`, everything else next to
    /// the `Info.plist`.
    pub fn executable_path(&self) -> Option<PathBuf> {
        let name = self.executable().filter(|n| !n.is_empty())?;
        let dir = self.path.parent()?;
        if dir.file_name().map(|n| n == "Contents").unwrap_or(false) {
            Some(dir.join("MacOS").join(name))
        } else {
            Some(dir.join(name))
        }
    }

    pub fn set_display_name(&mut self, name: &str) {
        self.dict
            .insert("CFBundleDisplayName".into(), Value::String(name.into()));
    }

    /// Lowers the minimum OS requirement of the main bundle.
    pub fn patch_minimum_version(&mut self, platform: Platform) {
        let (key, value) = platform.minimum_version_patch();
        self.dict.insert(key.into(), Value::String(value.into()));
    }

    /// Applies the per-component device patches. No-op on macOS.
    pub fn apply_patches(&mut self, platform: Platform, patches: &InfoPatches) {
        if !platform.supports_device_patches() {
            return;
        }

        if patches.all_devices {
            tracing::info!("force enabling support for all devices");
            self.dict.remove("UISupportedDevices");
            self.dict.insert(
                "UIDeviceFamily".into(),
                Value::Array((1..=4i64).map(|n| Value::Integer(n.into())).collect()),
            );
        }

        if patches.mac_compat {
            self.dict.remove("UIRequiresFullScreen");
            for device in ["ipad", "iphone", "ipod"] {
                self.dict
                    .remove(&format!("UISupportedInterfaceOrientations~{device}"));
            }
            self.dict.insert(
                "UISupportedInterfaceOrientations".into(),
                Value::Array(
                    ALL_ORIENTATIONS
                        .iter()
                        .map(|o| Value::String((*o).into()))
                        .collect(),
                ),
            );
        }

        if patches.file_sharing {
            tracing::info!("force enabling file sharing");
            self.dict
                .insert("UIFileSharingEnabled".into(), Value::Boolean(true));
            self.dict
                .insert("UISupportsDocumentBrowser".into(), Value::Boolean(true));
        }
    }
}
