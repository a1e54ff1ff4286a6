//! Ordered, concurrent signing of a bundle tree.

use super::tool::{CodeSigner, SigningHandle};
use crate::bundle::BundleComponent;
use crate::patch::Patcher;
use crate::progress::{signing_milestone, Progress};
use crate::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Work done on a primary component right before it is signed, after
/// its descendants have finished and patches have been applied.
pub trait LaunchHook {
    fn before_launch(&mut self, component: &BundleComponent) -> Result<()>;
}

impl LaunchHook for () {
    fn before_launch(&mut self, _component: &BundleComponent) -> Result<()> {
        Ok(())
    }
}

/// A launched signing operation.
struct SigningJob {
    handle: Box<dyn SigningHandle>,
    // Kept alive until the tool has read it.
    _entitlements: Option<NamedTempFile>,
}

impl SigningJob {
    fn wait(self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "waiting for signing job");
        let result = self.handle.wait();
        match &result {
            Ok(()) => tracing::info!(path = %path.display(), "signed"),
            Err(e) => tracing::error!(path = %path.display(), error = %e, "signing failed"),
        }
        result
    }
}

/// Signing Coordinator.
///
/// Components are launched in the order given, which must be leaf-first.
/// Before a component is launched every registered job under its path is
/// joined, so a container is never sealed before its contents. Unrelated
/// jobs keep running in the background.
pub struct SigningCoordinator<'a> {
    signer: &'a dyn CodeSigner,
    patcher: Option<Patcher>,
    running: BTreeMap<PathBuf, SigningJob>,
}

impl<'a> SigningCoordinator<'a> {
    pub fn new(signer: &'a dyn CodeSigner) -> Self {
        Self {
            signer,
            patcher: None,
            running: BTreeMap::new(),
        }
    }

    /// Applies binary patches to every component before signing it.
    pub fn with_patcher(mut self, patcher: Patcher) -> Self {
        self.patcher = Some(patcher);
        self
    }

    /// Signs all `components`.
    ///
    /// On failure every other in-flight job is still joined before the
    /// first error is returned.
    pub fn run(
        &mut self,
        components: &[BundleComponent],
        hook: &mut dyn LaunchHook,
        progress: &dyn Progress,
    ) -> Result<()> {
        let total = components.len();
        for (i, component) in components.iter().enumerate() {
            progress.report(
                signing_milestone(i, total),
                &format!("Signing component {}/{}", i + 1, total),
            );
            if let Err(e) = self.process(component, hook) {
                let _ = self.drain_all();
                return Err(e);
            }
        }
        tracing::info!("waiting for remaining components to finish signing");
        self.drain_all()
    }

    fn process(&mut self, component: &BundleComponent, hook: &mut dyn LaunchHook) -> Result<()> {
        tracing::info!(path = %component.path.display(), kind = ?component.kind, "processing component");
        self.drain_descendants(&component.path)?;

        let sc_info = component.path.join("SC_Info");
        if sc_info.is_dir() {
            tracing::warn!(
                path = %sc_info.display(),
                "removing leftover store metadata, encrypted apps will fail to launch"
            );
            std::fs::remove_dir_all(&sc_info)?;
        }

        if let Some(patcher) = &self.patcher {
            patcher.patch_component(component)?;
        }

        let job = match &component.grant {
            Some(grant) if component.is_primary() => {
                hook.before_launch(component)?;
                let file = tempfile::Builder::new()
                    .prefix("entitlements")
                    .suffix(".plist")
                    .tempfile()?;
                grant.write_xml(file.path())?;
                tracing::debug!(
                    path = %component.path.display(),
                    entitlements = ?grant.key_names(),
                    "signing with generated entitlements"
                );
                SigningJob {
                    handle: self.signer.launch(&component.path, Some(file.path()))?,
                    _entitlements: Some(file),
                }
            }
            _ => {
                tracing::debug!(path = %component.path.display(), "signing with original entitlements");
                SigningJob {
                    handle: self.signer.launch(&component.path, None)?,
                    _entitlements: None,
                }
            }
        };
        self.running.insert(component.path.clone(), job);
        Ok(())
    }

    /// Joins every registered job strictly below `path`.
    fn drain_descendants(&mut self, path: &Path) -> Result<()> {
        let nested: Vec<PathBuf> = self
            .running
            .keys()
            .filter(|p| p.starts_with(path) && p.as_path() != path)
            .cloned()
            .collect();
        for p in nested {
            if let Some(job) = self.running.remove(&p) {
                job.wait(&p)?;
            }
        }
        Ok(())
    }

    fn drain_all(&mut self) -> Result<()> {
        let mut first_error = None;
        for (path, job) in std::mem::take(&mut self.running) {
            if let Err(e) = job.wait(&path) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of jobs launched but not yet joined.
    pub fn in_flight(&self) -> usize {
        self.running.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::ComponentKind;
    use crate::entitlements::CapabilityGrant;
    use crate::progress::NoProgress;
    use crate::Error;
    use plist::Dictionary;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeHandle {
        name: String,
        log: Log,
        fail: bool,
    }

    impl SigningHandle for FakeHandle {
        fn wait(self: Box<Self>) -> Result<()> {
            self.log.lock().unwrap().push(format!("wait {}", self.name));
            if self.fail {
                return Err(Error::ExternalTool {
                    command: format!("codesign {}", self.name),
                    status: Some(1),
                    stdout: String::new(),
                    stderr: "boom".into(),
                });
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSigner {
        log: Log,
        failing: Vec<String>,
    }

    impl CodeSigner for FakeSigner {
        fn launch(&self, path: &Path, entitlements: Option<&Path>) -> Result<Box<dyn SigningHandle>> {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if let Some(e) = entitlements {
                assert!(e.is_file());
            }
            self.log.lock().unwrap().push(format!("launch {name}"));
            Ok(Box::new(FakeHandle {
                fail: self.failing.contains(&name),
                name,
                log: self.log.clone(),
            }))
        }

        fn dump_entitlements(&self, _path: &Path) -> Result<Dictionary> {
            Ok(Dictionary::new())
        }
    }

    fn component(path: &str, kind: ComponentKind) -> BundleComponent {
        let grant = kind.is_primary().then(|| CapabilityGrant::Inherited(Dictionary::new()));
        BundleComponent {
            path: PathBuf::from(path),
            kind,
            depth: Path::new(path).components().count(),
            info_plist: None,
            executable: None,
            original_id: None,
            assigned_id: None,
            grant,
        }
    }

    fn log_of(signer: &FakeSigner) -> Vec<String> {
        signer.log.lock().unwrap().clone()
    }

    #[test]
    fn test_container_waits_only_for_descendants() {
        let signer = FakeSigner::default();
        let components = vec![
            component("/t/Payload/A.app/PlugIns/B.appex", ComponentKind::Extension),
            component("/t/Payload/C.dylib", ComponentKind::Library),
            component("/t/Payload/A.app", ComponentKind::MainApp),
        ];

        let mut coordinator = SigningCoordinator::new(&signer);
        coordinator.run(&components, &mut (), &NoProgress).unwrap();

        let log = log_of(&signer);
        let wait_b = log.iter().position(|l| l == "wait B.appex").unwrap();
        let launch_a = log.iter().position(|l| l == "launch A.app").unwrap();
        let wait_c = log.iter().position(|l| l == "wait C.dylib").unwrap();
        assert!(wait_b < launch_a);
        assert!(wait_c > launch_a);
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn test_sibling_prefix_is_not_a_descendant() {
        let signer = FakeSigner::default();
        let components = vec![
            component("/t/A.app2/X.dylib", ComponentKind::Library),
            component("/t/A.app", ComponentKind::MainApp),
        ];
        SigningCoordinator::new(&signer)
            .run(&components, &mut (), &NoProgress)
            .unwrap();
        let log = log_of(&signer);
        assert_eq!(log[1], "launch A.app");
    }

    #[test]
    fn test_failure_drains_everything_then_reports() {
        let signer = FakeSigner {
            failing: vec!["B.appex".into()],
            ..Default::default()
        };
        let components = vec![
            component("/t/A.app/PlugIns/B.appex", ComponentKind::Extension),
            component("/t/C.dylib", ComponentKind::Library),
            component("/t/A.app", ComponentKind::MainApp),
        ];

        let mut coordinator = SigningCoordinator::new(&signer);
        let err = coordinator.run(&components, &mut (), &NoProgress).unwrap_err();
        assert!(matches!(err, Error::ExternalTool { .. }));

        let log = log_of(&signer);
        assert!(log.contains(&"wait C.dylib".to_string()));
        assert!(!log.contains(&"launch A.app".to_string()));
        assert_eq!(coordinator.in_flight(), 0);
    }

    #[test]
    fn test_hook_runs_for_primary_only() {
        struct Recorder(Vec<PathBuf>);
        impl LaunchHook for Recorder {
            fn before_launch(&mut self, component: &BundleComponent) -> Result<()> {
                self.0.push(component.path.clone());
                Ok(())
            }
        }

        let signer = FakeSigner::default();
        let components = vec![
            component("/t/A.app/Frameworks/F.framework", ComponentKind::Framework),
            component("/t/A.app", ComponentKind::MainApp),
        ];
        let mut hook = Recorder(Vec::new());
        SigningCoordinator::new(&signer)
            .run(&components, &mut hook, &NoProgress)
            .unwrap();
        assert_eq!(hook.0, vec![PathBuf::from("/t/A.app")]);
    }

    #[test]
    fn test_store_metadata_removed_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("A.app");
        std::fs::create_dir_all(app.join("SC_Info")).unwrap();
        std::fs::write(app.join("SC_Info/A.sinf"), b"sinf").unwrap();

        let signer = FakeSigner::default();
        let components = vec![component(app.to_str().unwrap(), ComponentKind::MainApp)];
        SigningCoordinator::new(&signer)
            .run(&components, &mut (), &NoProgress)
            .unwrap();

        assert!(!app.join("SC_Info").exists());
        assert_eq!(log_of(&signer), vec!["launch A.app", "wait A.app"]);
    }
}
