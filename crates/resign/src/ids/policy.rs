//! Selection of the main bundle identifier.

use super::mapper::IdentifierMapper;
use crate::Result;

/// Which identifier the main bundle should carry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BundleIdRequest {
    /// Keep the identifier found in the bundle (unless encoding applies).
    #[default]
    Original,
    /// Take the identifier from the provisioning profile.
    FromProfile,
    /// Use exactly this identifier.
    Custom(String),
}

impl BundleIdRequest {
    /// `None` keeps the original, an empty string asks for the profile's
    /// identifier and anything else is a custom identifier.
    pub fn from_option(value: Option<&str>) -> Self {
        match value {
            None => BundleIdRequest::Original,
            Some("") => BundleIdRequest::FromProfile,
            Some(id) => BundleIdRequest::Custom(id.to_string()),
        }
    }
}

/// Persistent old→new bundle identifier store shared between jobs of the
/// same account.
pub trait IdentifierStore {
    /// Looks up a previously issued identifier.
    fn lookup(&self, original: &str) -> Result<Option<String>>;

    /// Records a newly issued identifier.
    fn store(&self, original: &str, assigned: &str) -> Result<()>;
}

/// Inputs needed to settle the main bundle identifier.
pub struct MainIdInputs<'a> {
    pub original: &'a str,
    pub request: &'a BundleIdRequest,
    /// `application-identifier` of the supplied provisioning profile.
    pub profile_app_id: Option<&'a str>,
    pub encode_ids: bool,
    pub store: Option<&'a dyn IdentifierStore>,
}

/// Computes the main bundle identifier. Called exactly once per run.
///
/// With a provisioning profile the profile decides unless a custom identifier
/// was requested. Without one, encoding reuses an identifier previously
/// issued for the same original (from `store`) or derives a fresh one with
/// the mapper and records it.
///
/// Store failures are logged and never fatal.
pub fn resolve_main_id(inputs: &MainIdInputs<'_>, mapper: &mut IdentifierMapper) -> String {
    if let Some(profile_app_id) = inputs.profile_app_id {
        return match inputs.request {
            BundleIdRequest::Original => {
                tracing::info!("using original bundle id");
                inputs.original.to_string()
            }
            BundleIdRequest::FromProfile => {
                let id = profile_app_id
                    .split_once('.')
                    .map(|(_, id)| id)
                    .unwrap_or(profile_app_id);
                if id == "*" {
                    tracing::info!("provisioning profile is wildcard, using original bundle id");
                    inputs.original.to_string()
                } else {
                    tracing::info!(bundle_id = id, "using provisioning profile's application id");
                    id.to_string()
                }
            }
            BundleIdRequest::Custom(id) => {
                tracing::info!(bundle_id = %id, "using custom bundle id");
                id.clone()
            }
        };
    }

    if let BundleIdRequest::Custom(id) = inputs.request {
        tracing::info!(bundle_id = %id, "using custom bundle id");
        return id.clone();
    }

    if !inputs.encode_ids {
        tracing::info!("using original bundle id");
        return inputs.original.to_string();
    }

    if let Some(store) = inputs.store {
        match store.lookup(inputs.original) {
            Ok(Some(existing)) => {
                tracing::info!(original = inputs.original, bundle_id = %existing, "reusing issued bundle id");
                return existing;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "bundle id lookup failed, deriving a new one"),
        }
    }

    let derived = mapper.get_or_create(inputs.original);
    tracing::info!(original = inputs.original, bundle_id = %derived, "derived encoded bundle id");
    if let Some(store) = inputs.store {
        if let Err(e) = store.store(inputs.original, &derived) {
            tracing::warn!(error = %e, "failed to record bundle id mapping");
        }
    }
    derived
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::cell::RefCell;

    #[derive(Default)]
    struct MemoryStore {
        existing: Option<String>,
        stored: RefCell<Vec<(String, String)>>,
        fail: bool,
    }

    impl IdentifierStore for MemoryStore {
        fn lookup(&self, _original: &str) -> Result<Option<String>> {
            if self.fail {
                return Err(Error::Remote {
                    endpoint: "bundle/get".into(),
                    message: "unavailable".into(),
                });
            }
            Ok(self.existing.clone())
        }

        fn store(&self, original: &str, assigned: &str) -> Result<()> {
            self.stored
                .borrow_mut()
                .push((original.to_string(), assigned.to_string()));
            Ok(())
        }
    }

    fn inputs<'a>(
        request: &'a BundleIdRequest,
        profile_app_id: Option<&'a str>,
        encode_ids: bool,
        store: Option<&'a dyn IdentifierStore>,
    ) -> MainIdInputs<'a> {
        MainIdInputs {
            original: "com.orig.App",
            request,
            profile_app_id,
            encode_ids,
            store,
        }
    }

    #[test]
    fn test_request_from_option() {
        assert_eq!(BundleIdRequest::from_option(None), BundleIdRequest::Original);
        assert_eq!(BundleIdRequest::from_option(Some("")), BundleIdRequest::FromProfile);
        assert_eq!(
            BundleIdRequest::from_option(Some("com.x")),
            BundleIdRequest::Custom("com.x".into())
        );
    }

    #[test]
    fn test_profile_application_id() {
        let mut mapper = IdentifierMapper::new("seed");
        let req = BundleIdRequest::FromProfile;
        let id = resolve_main_id(&inputs(&req, Some("TEAM.com.prof.App"), true, None), &mut mapper);
        assert_eq!(id, "com.prof.App");

        let id = resolve_main_id(&inputs(&req, Some("TEAM.*"), true, None), &mut mapper);
        assert_eq!(id, "com.orig.App");
    }

    #[test]
    fn test_encoded_without_store_uses_mapper() {
        let mut mapper = IdentifierMapper::new("seed");
        let req = BundleIdRequest::Original;
        let id = resolve_main_id(&inputs(&req, None, true, None), &mut mapper);
        assert_ne!(id, "com.orig.App");
        assert_eq!(id.len(), "com.orig.App".len());
    }

    #[test]
    fn test_encoded_reuses_stored_id() {
        let mut mapper = IdentifierMapper::new("seed");
        let store = MemoryStore {
            existing: Some("com.prev.App".into()),
            ..Default::default()
        };
        let req = BundleIdRequest::Original;
        let id = resolve_main_id(&inputs(&req, None, true, Some(&store)), &mut mapper);
        assert_eq!(id, "com.prev.App");
        assert!(store.stored.borrow().is_empty());
    }

    #[test]
    fn test_encoded_stores_new_id_and_tolerates_lookup_failure() {
        let mut mapper = IdentifierMapper::new("seed");
        let store = MemoryStore {
            fail: true,
            ..Default::default()
        };
        let req = BundleIdRequest::Original;
        let id = resolve_main_id(&inputs(&req, None, true, Some(&store)), &mut mapper);
        assert_eq!(store.stored.borrow().as_slice(), &[("com.orig.App".to_string(), id)]);
    }

    #[test]
    fn test_no_encoding_keeps_original() {
        let mut mapper = IdentifierMapper::new("seed");
        let req = BundleIdRequest::Original;
        assert_eq!(resolve_main_id(&inputs(&req, None, false, None), &mut mapper), "com.orig.App");
    }
}
