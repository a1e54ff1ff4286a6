//! Bundle tree discovery.
//!
//! Finds every signable component below the main application and orders
//! them deepest-first, so that nested signatures exist before the bundle
//! containing them is sealed.

use super::info::{find_info_plist, InfoPlist};
use crate::entitlements::CapabilityGrant;
use crate::{Error, Result};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Names left behind by archivers and Finder that are never components.
const JUNK_NAMES: &[&str] = &[".DS_Store", ".AppleDouble", "__MACOSX"];

/// Kind of signable component, derived from its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    /// `.app` bundle, either the root application or a nested one.
    MainApp,
    /// `.appex` app extension.
    Extension,
    /// `.framework` bundle.
    Framework,
    /// Standalone `.dylib`.
    Library,
    /// `PlugIns/*.bundle`.
    PluginBundle,
}

impl ComponentKind {
    fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_string_lossy().to_lowercase();
        match ext.as_str() {
            "app" => Some(ComponentKind::MainApp),
            "appex" => Some(ComponentKind::Extension),
            "framework" => Some(ComponentKind::Framework),
            "dylib" => Some(ComponentKind::Library),
            "bundle" => {
                let in_plugins = path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|n| n == "PlugIns")
                    .unwrap_or(false);
                in_plugins.then_some(ComponentKind::PluginBundle)
            }
            _ => None,
        }
    }

    /// Primary components receive a new identifier and a fresh grant.
    pub fn is_primary(self) -> bool {
        matches!(self, ComponentKind::MainApp | ComponentKind::Extension)
    }
}

/// One signable component of the bundle tree.
#[derive(Debug, Clone)]
pub struct BundleComponent {
    pub path: PathBuf,
    pub kind: ComponentKind,
    /// Number of path components below the main application.
    pub depth: usize,
    /// Metadata descriptor, always present for primary components.
    pub info_plist: Option<PathBuf>,
    /// Executable named by `CFBundleExecutable`, when the descriptor has one.
    pub executable: Option<PathBuf>,
    pub original_id: Option<String>,
    /// Filled in by the pipeline for primary components.
    pub assigned_id: Option<String>,
    /// Filled in by the pipeline for primary components.
    pub grant: Option<CapabilityGrant>,
}

impl BundleComponent {
    pub fn is_primary(&self) -> bool {
        self.kind.is_primary()
    }
}

/// Result of scanning an extracted tree.
#[derive(Debug)]
pub struct BundleTree {
    pub main_app: PathBuf,
    /// Deepest-first; the main application is always last.
    pub components: Vec<BundleComponent>,
}

impl BundleTree {
    /// Scans `root` for the main application and all of its components.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no `.app` bundle exists below `root`, and
    /// [`Error::Bundle`] if a primary component has no readable `Info.plist`.
    pub fn scan(root: impl AsRef<Path>) -> Result<Self> {
        Self::scan_app(find_main_app(root.as_ref())?)
    }

    /// Scans the components of an already located main application.
    pub fn scan_app(main_app: PathBuf) -> Result<Self> {
        let mut components = Vec::new();

        for entry in WalkDir::new(&main_app)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_junk(e.path()))
        {
            let entry = entry?;
            if entry.path_is_symlink() {
                continue;
            }
            let path = entry.path();
            let Some(kind) = ComponentKind::from_path(path) else {
                continue;
            };
            if kind == ComponentKind::Library && !entry.file_type().is_file() {
                continue;
            }
            let depth = path
                .strip_prefix(&main_app)
                .map(|rel| rel.components().count())
                .unwrap_or(0);
            components.push(describe(path.to_path_buf(), kind, depth)?);
        }

        // Deeper paths first; reverse lexical order among siblings keeps the
        // result stable between runs.
        components.sort_by(|a, b| b.depth.cmp(&a.depth).then_with(|| b.path.cmp(&a.path)));
        components.push(describe(main_app.clone(), ComponentKind::MainApp, 0)?);

        tracing::info!(
            main_app = %main_app.display(),
            components = components.len(),
            "scanned bundle tree"
        );

        Ok(Self {
            main_app,
            components,
        })
    }

    pub fn main(&self) -> Option<&BundleComponent> {
        self.components.last()
    }
}

/// Returns the shallowest `.app` directory below `root`.
///
/// Nested copies of applications are always deeper than the main one, so the
/// shortest matching path wins.
pub fn find_main_app(root: &Path) -> Result<PathBuf> {
    WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| !is_junk(e.path()))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .map(|ext| ext.eq_ignore_ascii_case("app"))
                .unwrap_or(false)
        })
        .min_by_key(|p| p.as_os_str().len())
        .ok_or_else(|| {
            Error::Config(format!("no .app bundle found in {}", root.display()))
        })
}

fn is_junk(path: &Path) -> bool {
    path.file_name()
        .map(|n| {
            let n = n.to_string_lossy();
            n.starts_with("._") || JUNK_NAMES.contains(&n.as_ref())
        })
        .unwrap_or(false)
}

fn describe(path: PathBuf, kind: ComponentKind, depth: usize) -> Result<BundleComponent> {
    let (info_plist, info) = if kind.is_primary() {
        let info_path = find_info_plist(&path)?;
        let info = InfoPlist::load(&info_path)?;
        (Some(info_path), Some(info))
    } else {
        let candidate = path.join("Info.plist");
        if candidate.is_file() {
            let info = InfoPlist::load(&candidate).ok();
            (Some(candidate), info)
        } else {
            (None, None)
        }
    };
    let original_id = match &info {
        Some(info) if kind.is_primary() => Some(info.bundle_identifier()?.to_string()),
        Some(info) => info.bundle_identifier().ok().map(str::to_string),
        None => None,
    };

    Ok(BundleComponent {
        path,
        kind,
        depth,
        info_plist,
        executable: info.as_ref().and_then(InfoPlist::executable_path),
        original_id,
        assigned_id: None,
        grant: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_info(dir: &Path, id: &str) {
        fs::create_dir_all(dir).unwrap();
        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>{id}</string>
<key>CFBundleExecutable</key><string>Bin</string>
</dict></plist>"#
        );
        fs::write(dir.join("Info.plist"), xml).unwrap();
    }

    fn build_tree(root: &Path) -> PathBuf {
        let app = root.join("Payload/Test.app");
        write_info(&app, "com.orig.App");
        write_info(&app.join("PlugIns/Share.appex"), "com.orig.App.Share");
        fs::create_dir_all(app.join("PlugIns/Share.appex/Frameworks/Inner.framework")).unwrap();
        fs::create_dir_all(app.join("Frameworks/Kit.framework")).unwrap();
        fs::write(app.join("Frameworks/Kit.framework/libextra.dylib"), b"dylib").unwrap();
        fs::write(app.join("Frameworks/libswiftCore.dylib"), b"dylib").unwrap();
        fs::create_dir_all(app.join("PlugIns/Filter.bundle")).unwrap();
        fs::create_dir_all(app.join("Resources/Assets.bundle")).unwrap();
        fs::write(app.join("._Junk.dylib"), b"junk").unwrap();
        app
    }

    #[test]
    fn test_scan_orders_descendants_first() {
        let temp = TempDir::new().unwrap();
        let app = build_tree(temp.path());

        let tree = BundleTree::scan(temp.path()).unwrap();
        assert_eq!(tree.main_app, app);
        assert_eq!(tree.main().unwrap().path, app);

        let paths: Vec<&Path> = tree.components.iter().map(|c| c.path.as_path()).collect();
        for (i, ancestor) in paths.iter().enumerate() {
            for descendant in &paths[i + 1..] {
                assert!(
                    !(descendant.starts_with(ancestor) && descendant != ancestor),
                    "{} appears after its ancestor {}",
                    descendant.display(),
                    ancestor.display()
                );
            }
        }
    }

    #[test]
    fn test_scan_classifies_components() {
        let temp = TempDir::new().unwrap();
        let app = build_tree(temp.path());
        let tree = BundleTree::scan(temp.path()).unwrap();

        let kind_of = |rel: &str| {
            tree.components
                .iter()
                .find(|c| c.path == app.join(rel))
                .map(|c| c.kind)
        };
        assert_eq!(kind_of("PlugIns/Share.appex"), Some(ComponentKind::Extension));
        assert_eq!(kind_of("Frameworks/Kit.framework"), Some(ComponentKind::Framework));
        assert_eq!(kind_of("Frameworks/libswiftCore.dylib"), Some(ComponentKind::Library));
        assert_eq!(kind_of("PlugIns/Filter.bundle"), Some(ComponentKind::PluginBundle));
        assert_eq!(kind_of("Resources/Assets.bundle"), None);
        assert_eq!(kind_of("._Junk.dylib"), None);

        let ext = tree
            .components
            .iter()
            .find(|c| c.kind == ComponentKind::Extension)
            .unwrap();
        assert_eq!(ext.original_id.as_deref(), Some("com.orig.App.Share"));
        assert_eq!(ext.executable, Some(app.join("PlugIns/Share.appex/Bin")));
        assert!(ext.is_primary());
    }

    #[test]
    fn test_main_app_is_shortest_path() {
        let temp = TempDir::new().unwrap();
        let app = build_tree(temp.path());
        write_info(&app.join("Watch/Nested.app"), "com.orig.App.watchkitapp");

        assert_eq!(find_main_app(temp.path()).unwrap(), app);
    }

    #[test]
    fn test_scan_without_app_is_configuration_error() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("Payload")).unwrap();
        let err = BundleTree::scan(temp.path()).unwrap_err();
        assert!(err.is_configuration());
    }
}
