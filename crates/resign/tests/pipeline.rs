//! End-to-end runs of the signing pipeline over synthetic bundle trees.
//!
//! The signing tool and the developer portal are replaced by in-memory
//! fakes that record what they were asked to do.

use plist::{Dictionary, Value};
use resign::entitlements::{CapabilityGrant, EntitlementKey};
use resign::ids::IdentifierStore;
use resign::platform::Platform;
use resign::portal::{ProfileKind, Provisioner};
use resign::sign::{CodeSigner, SigningHandle};
use resign::{Error, Result, SignOptions, Signer};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tempfile::TempDir;

const TEAM: &str = "NEWTEAM123";

struct Done(Result<()>);

impl SigningHandle for Done {
    fn wait(self: Box<Self>) -> Result<()> {
        self.0
    }
}

#[derive(Debug, Clone)]
struct Launch {
    path: PathBuf,
    entitlements: Option<Dictionary>,
}

#[derive(Default, Clone)]
struct FakeSigner {
    launches: Rc<RefCell<Vec<Launch>>>,
    fail_on: Option<&'static str>,
}

impl CodeSigner for FakeSigner {
    fn launch(&self, path: &Path, entitlements: Option<&Path>) -> Result<Box<dyn SigningHandle>> {
        let entitlements = entitlements
            .map(|p| plist::from_file::<_, Dictionary>(p))
            .transpose()?;
        self.launches.borrow_mut().push(Launch {
            path: path.to_path_buf(),
            entitlements,
        });
        let failed = self
            .fail_on
            .map(|name| path.ends_with(name))
            .unwrap_or(false);
        if failed {
            return Ok(Box::new(Done(Err(Error::ExternalTool {
                command: "codesign".into(),
                status: Some(1),
                stdout: String::new(),
                stderr: "boom".into(),
            }))));
        }
        Ok(Box::new(Done(Ok(()))))
    }

    fn dump_entitlements(&self, path: &Path) -> Result<Dictionary> {
        if path.ends_with("Share.appex") {
            return Err(Error::ExternalTool {
                command: "codesign -d".into(),
                status: Some(1),
                stdout: String::new(),
                stderr: "code object is not signed at all".into(),
            });
        }
        let mut dict = Dictionary::new();
        dict.insert("application-identifier".into(), "OLDTEAM999.com.orig.App".into());
        dict.insert("com.apple.developer.team-identifier".into(), "OLDTEAM999".into());
        dict.insert(
            "com.apple.security.application-groups".into(),
            Value::Array(vec!["group.com.orig.App".into()]),
        );
        dict.insert("aps-environment".into(), "production".into());
        dict.insert("com.example.private-entitlement".into(), Value::Boolean(true));
        Ok(dict)
    }
}

#[derive(Default, Clone)]
struct FakePortal {
    authenticated: Rc<RefCell<bool>>,
    registered: Rc<RefCell<Vec<String>>>,
    issued: Rc<RefCell<Vec<(String, ProfileKind)>>>,
}

impl Provisioner for FakePortal {
    fn authenticate(&mut self) -> Result<()> {
        *self.authenticated.borrow_mut() = true;
        Ok(())
    }

    fn register_app(&self, bundle_id: &str, grant: &CapabilityGrant) -> Result<()> {
        assert!(grant.get_task_allow().is_some());
        self.registered.borrow_mut().push(bundle_id.to_string());
        Ok(())
    }

    fn issue_profile(
        &self,
        bundle_id: &str,
        kind: ProfileKind,
        _platform: Platform,
        out: &Path,
    ) -> Result<()> {
        fs::write(out, b"issued profile")?;
        self.issued.borrow_mut().push((bundle_id.to_string(), kind));
        Ok(())
    }
}

fn write_info(dir: &Path, id: &str, executable: &str) {
    fs::create_dir_all(dir).unwrap();
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>CFBundleIdentifier</key><string>{id}</string>
<key>CFBundleExecutable</key><string>{executable}</string>
</dict></plist>"#
    );
    fs::write(dir.join("Info.plist"), xml).unwrap();
}

/// `Payload/Test.app` with one extension and one framework. The extension's
/// executable is not named after its bundle.
fn build_tree(root: &Path) -> PathBuf {
    let app = root.join("Payload/Test.app");
    write_info(&app, "com.orig.App", "Test");
    fs::write(app.join("Test"), b"\x00id=com.orig.App;team=OLDTEAM999\x00").unwrap();
    write_info(&app.join("PlugIns/Share.appex"), "com.orig.App.Share", "ShareExtension");
    fs::write(
        app.join("PlugIns/Share.appex/ShareExtension"),
        b"\x00com.orig.App.Share\x00",
    )
    .unwrap();
    fs::create_dir_all(app.join("Frameworks/Kit.framework")).unwrap();
    fs::write(app.join("Frameworks/Kit.framework/Kit"), b"kit").unwrap();
    app
}

fn bundle_id(info_plist: &Path) -> String {
    let value: Value = plist::from_file(info_plist).unwrap();
    value
        .as_dictionary()
        .and_then(|d| d.get("CFBundleIdentifier"))
        .and_then(Value::as_string)
        .unwrap()
        .to_string()
}

fn options(root: &Path) -> SignOptions {
    SignOptions::new(root, "Apple Development: Dev (NEWTEAM123)")
        .team_id(TEAM)
        .encode_ids(true)
        .mapper_secret("seed")
}

fn launch_for<'a>(launches: &'a [Launch], suffix: &str) -> &'a Launch {
    launches
        .iter()
        .find(|l| l.path.ends_with(suffix))
        .unwrap_or_else(|| panic!("{suffix} was not signed"))
}

#[test]
fn test_encoded_ids_without_profile() {
    let temp = TempDir::new().unwrap();
    let app = build_tree(temp.path());
    let signer = FakeSigner::default();
    let portal = FakePortal::default();

    let report = Signer::new(options(temp.path()).patch_ids(true))
        .unwrap()
        .code_signer(signer.clone())
        .provisioner(portal.clone())
        .sign()
        .unwrap();

    let main_id = report.main_bundle_id.clone();
    assert_ne!(main_id, "com.orig.App");
    assert_eq!(main_id.len(), "com.orig.App".len());
    assert_eq!(
        main_id.split('.').map(str::len).collect::<Vec<_>>(),
        vec![3, 4, 3]
    );
    let share_id = format!("{main_id}.Share");

    assert_eq!(bundle_id(&app.join("Info.plist")), main_id);
    assert_eq!(bundle_id(&app.join("PlugIns/Share.appex/Info.plist")), share_id);
    assert_eq!(report.mappings.get("com.orig.App"), Some(&main_id));
    assert_eq!(report.mappings.get("com.orig.App.Share"), Some(&share_id));
    assert_eq!(report.mappings.get("OLDTEAM999").map(String::as_str), Some(TEAM));
    assert!(report
        .removed_entitlements
        .contains("com.example.private-entitlement"));
    assert!(report.capabilities.contains("app_groups"));
    assert!(report.capabilities.contains("push_notifications"));
    assert!(report.original_entitlements.contains_key("aps-environment"));

    let launches = signer.launches.borrow();
    assert_eq!(launches.len(), 3);
    assert!(launches.last().unwrap().path.ends_with("Test.app"));
    assert!(launch_for(&launches, "Kit.framework").entitlements.is_none());

    for (suffix, id) in [("Test.app", &main_id), ("Share.appex", &share_id)] {
        let entitlements = launch_for(&launches, suffix).entitlements.clone().unwrap();
        assert_eq!(entitlements.get("get-task-allow"), Some(&Value::Boolean(true)));
        assert_eq!(
            entitlements.get("application-identifier").and_then(Value::as_string),
            Some(format!("{TEAM}.{id}").as_str())
        );
        for key in entitlements.keys() {
            assert!(
                EntitlementKey::parse(key, Platform::Ios).is_some(),
                "{key} is not allow-listed"
            );
        }
    }

    let main = launch_for(&launches, "Test.app").entitlements.clone().unwrap();
    assert_eq!(
        main.get("aps-environment").and_then(Value::as_string),
        Some("development")
    );
    assert_eq!(
        main.get("com.apple.security.application-groups"),
        Some(&Value::Array(vec![Value::String(format!("group.{main_id}"))]))
    );

    assert!(*portal.authenticated.borrow());
    assert_eq!(*portal.registered.borrow(), vec![share_id.clone(), main_id.clone()]);
    assert!(portal
        .issued
        .borrow()
        .iter()
        .all(|(_, kind)| *kind == ProfileKind::Development));
    assert!(app.join("embedded.mobileprovision").is_file());
    assert!(app.join("PlugIns/Share.appex/embedded.mobileprovision").is_file());

    let binary = fs::read(app.join("Test")).unwrap();
    let expected = format!("\x00id={main_id};team={TEAM}\x00");
    assert_eq!(binary, expected.as_bytes());
    let extension = fs::read(app.join("PlugIns/Share.appex/ShareExtension")).unwrap();
    assert_eq!(extension, format!("\x00{share_id}\x00").as_bytes());
}

#[test]
fn test_identifiers_are_stable_across_runs() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    build_tree(first.path());
    build_tree(second.path());

    let prepare = |root: &Path| {
        Signer::new(options(root))
            .unwrap()
            .code_signer(FakeSigner::default())
            .prepare()
            .unwrap()
            .report()
    };
    let a = prepare(first.path());
    let b = prepare(second.path());
    assert_eq!(a.main_bundle_id, b.main_bundle_id);
    assert_eq!(a.mappings, b.mappings);
}

#[test]
fn test_without_patching_binaries_are_untouched() {
    let temp = TempDir::new().unwrap();
    let app = build_tree(temp.path());

    Signer::new(options(temp.path()))
        .unwrap()
        .code_signer(FakeSigner::default())
        .provisioner(FakePortal::default())
        .sign()
        .unwrap();

    let binary = fs::read(app.join("Test")).unwrap();
    assert_eq!(binary, b"\x00id=com.orig.App;team=OLDTEAM999\x00");
}

const PROFILE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<plist version="1.0"><dict>
<key>Name</key><string>Wildcard</string>
<key>TeamIdentifier</key><array><string>NEWTEAM123</string></array>
<key>Entitlements</key><dict>
<key>application-identifier</key><string>NEWTEAM123.*</string>
<key>keychain-access-groups</key><array><string>NEWTEAM123.*</string></array>
<key>get-task-allow</key><false/>
<key>com.apple.developer.team-identifier</key><string>NEWTEAM123</string>
</dict>
</dict></plist>"#;

#[test]
fn test_supplied_profile_is_inherited_and_embedded() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("tree");
    let app = build_tree(&root);
    let profile = temp.path().join("prov.mobileprovision");
    fs::write(&profile, PROFILE).unwrap();
    let signer = FakeSigner::default();

    let report = Signer::new(
        SignOptions::new(&root, "Apple Development: Dev (NEWTEAM123)").provisioning_profile(&profile),
    )
    .unwrap()
    .code_signer(signer.clone())
    .sign()
    .unwrap();

    assert_eq!(report.main_bundle_id, "com.orig.App");
    assert_eq!(fs::read_to_string(app.join("embedded.mobileprovision")).unwrap(), PROFILE);

    let launches = signer.launches.borrow();
    let main = launch_for(&launches, "Test.app").entitlements.clone().unwrap();
    assert_eq!(
        main.get("application-identifier").and_then(Value::as_string),
        Some("NEWTEAM123.com.orig.App")
    );
    assert_eq!(main.get("get-task-allow"), Some(&Value::Boolean(true)));
    // The original grant has no keychain groups.
    assert!(main.get("keychain-access-groups").is_none());

    let share = launch_for(&launches, "Share.appex").entitlements.clone().unwrap();
    assert_eq!(
        share.get("application-identifier").and_then(Value::as_string),
        Some("NEWTEAM123.com.orig.App.Share")
    );
}

#[derive(Default)]
struct RecordingStore {
    calls: RefCell<Vec<String>>,
}

impl IdentifierStore for RecordingStore {
    fn lookup(&self, original: &str) -> Result<Option<String>> {
        self.calls.borrow_mut().push(format!("lookup {original}"));
        Ok(None)
    }

    fn store(&self, original: &str, assigned: &str) -> Result<()> {
        self.calls.borrow_mut().push(format!("store {original}->{assigned}"));
        Ok(())
    }
}

#[test]
fn test_no_profile_and_no_account_signs_nothing() {
    let temp = TempDir::new().unwrap();
    let app = build_tree(temp.path());
    fs::create_dir_all(app.join("Watch")).unwrap();
    let info_before = fs::read(app.join("Info.plist")).unwrap();
    let signer = FakeSigner::default();
    let store = RecordingStore::default();

    let err = Signer::new(options(temp.path()).display_name("Renamed"))
        .unwrap()
        .code_signer(signer.clone())
        .identifier_store(&store)
        .sign()
        .unwrap_err();

    assert!(matches!(err, Error::MissingCredentials(_)));
    assert!(signer.launches.borrow().is_empty());
    assert!(store.calls.borrow().is_empty());
    assert!(app.join("Watch").is_dir());
    assert_eq!(fs::read(app.join("Info.plist")).unwrap(), info_before);
}

#[test]
fn test_failed_component_fails_the_run() {
    let temp = TempDir::new().unwrap();
    build_tree(temp.path());
    let signer = FakeSigner {
        fail_on: Some("Kit.framework"),
        ..FakeSigner::default()
    };

    let err = Signer::new(options(temp.path()))
        .unwrap()
        .code_signer(signer.clone())
        .provisioner(FakePortal::default())
        .sign()
        .unwrap_err();

    assert!(matches!(err, Error::ExternalTool { ref stderr, .. } if stderr == "boom"));
}
