//! Old→new identifier table.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Deterministic generator and cache of identifier substitutions.
///
/// Generated identifiers keep the dot-separated shape of the input: every
/// segment is replaced by a string of the same length derived from the
/// segment text and the shared seed. Re-running a failed job with the same
/// seed therefore yields the same identifiers, and the same provisioning
/// state on the developer portal.
///
/// Entries are immutable once recorded.
#[derive(Debug, Clone)]
pub struct IdentifierMapper {
    seed: String,
    table: BTreeMap<String, String>,
}

impl IdentifierMapper {
    pub fn new(seed: impl Into<String>) -> Self {
        Self {
            seed: seed.into(),
            table: BTreeMap::new(),
        }
    }

    /// Returns the mapping for `original`, deriving and recording one if
    /// none exists yet.
    ///
    /// Blank identifiers are returned unchanged and never recorded.
    pub fn get_or_create(&mut self, original: &str) -> String {
        if original.trim().is_empty() {
            return original.to_string();
        }
        if let Some(existing) = self.table.get(original) {
            return existing.clone();
        }

        let derived = original
            .split('.')
            .map(|segment| derive_segment(segment, &self.seed))
            .collect::<Vec<_>>()
            .join(".");
        tracing::debug!(original, derived = %derived, "derived identifier");
        self.table.insert(original.to_string(), derived.clone());
        derived
    }

    /// Records an externally resolved mapping.
    ///
    /// Registering an identity pair or re-registering an existing pair is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MappingConflict`] if `old` is already mapped to a
    /// different value.
    pub fn register(&mut self, old: &str, new: &str) -> Result<()> {
        if old == new {
            return Ok(());
        }
        match self.table.get(old) {
            Some(existing) if existing == new => Ok(()),
            Some(existing) => Err(Error::MappingConflict {
                original: old.to_string(),
                existing: existing.clone(),
                requested: new.to_string(),
            }),
            None => {
                self.table.insert(old.to_string(), new.to_string());
                Ok(())
            }
        }
    }

    pub fn get(&self, old: &str) -> Option<&str> {
        self.table.get(old).map(String::as_str)
    }

    /// Copy of the full table, for audit output.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.table.clone()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Substitutions safe to apply to binaries in place.
    ///
    /// Only pairs of equal byte length qualify. The result is ordered longest
    /// key first so a shorter pattern never matches inside a longer one that
    /// has already been replaced.
    pub fn patch_set(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .table
            .iter()
            .filter(|(old, new)| old.len() == new.len())
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        pairs.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        pairs
    }
}

/// Derives the identifier of a nested component from the main bundle's
/// substitution, keeping whatever followed the main identifier.
///
/// `com.orig.App.ext` becomes `com.new.App.ext` when `com.orig.App` maps to
/// `com.new.App`. Returns `None` when `component_id` is not nested under
/// `old_main`.
pub fn derive_nested_id(old_main: &str, new_main: &str, component_id: &str) -> Option<String> {
    let suffix = component_id.strip_prefix(old_main)?;
    if !suffix.is_empty() && !suffix.starts_with('.') {
        return None;
    }
    Some(format!("{new_main}{suffix}"))
}

fn derive_segment(segment: &str, seed: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    let mut counter: u32 = 0;
    while out.len() < segment.len() {
        let mut hasher = Sha256::new();
        hasher.update((seed.len() as u64).to_le_bytes());
        hasher.update(seed.as_bytes());
        hasher.update(segment.as_bytes());
        hasher.update(counter.to_le_bytes());
        for byte in hasher.finalize() {
            if out.len() == segment.len() {
                break;
            }
            out.push(ALPHABET[byte as usize % ALPHABET.len()] as char);
        }
        counter += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_is_deterministic() {
        let mut a = IdentifierMapper::new("TEAM123456");
        let mut b = IdentifierMapper::new("TEAM123456");
        let id = "com.example.VeryLongApplicationNameThatExceedsOneDigestBlock1234567890";

        let first = a.get_or_create(id);
        assert_eq!(first, a.get_or_create(id));
        assert_eq!(first, b.get_or_create(id));
        assert_ne!(first, id);

        for (old, new) in id.split('.').zip(first.split('.')) {
            assert_eq!(old.len(), new.len());
        }
    }

    #[test]
    fn test_seed_changes_output() {
        let mut a = IdentifierMapper::new("TEAMAAAAAA");
        let mut b = IdentifierMapper::new("TEAMBBBBBB");
        assert_ne!(a.get_or_create("com.example.app"), b.get_or_create("com.example.app"));
    }

    #[test]
    fn test_blank_identifier_passthrough() {
        let mut mapper = IdentifierMapper::new("seed");
        assert_eq!(mapper.get_or_create("  "), "  ");
        assert!(mapper.is_empty());
    }

    #[test]
    fn test_register_idempotent_and_conflicting() {
        let mut mapper = IdentifierMapper::new("seed");
        mapper.register("com.orig.App", "com.new.App").unwrap();
        mapper.register("com.orig.App", "com.new.App").unwrap();
        assert_eq!(mapper.len(), 1);

        let err = mapper.register("com.orig.App", "com.other.App").unwrap_err();
        assert!(matches!(err, Error::MappingConflict { .. }));
        assert_eq!(mapper.get("com.orig.App"), Some("com.new.App"));
    }

    #[test]
    fn test_get_or_create_returns_registered_value() {
        let mut mapper = IdentifierMapper::new("seed");
        mapper.register("com.orig.App", "com.new.Application").unwrap();
        assert_eq!(mapper.get_or_create("com.orig.App"), "com.new.Application");
    }

    #[test]
    fn test_patch_set_filters_unequal_lengths() {
        let mut mapper = IdentifierMapper::new("seed");
        mapper.register("abc.def", "xyz.def").unwrap();
        mapper.register("a.b", "ccc.d").unwrap();

        let patches = mapper.patch_set();
        assert_eq!(patches, vec![("abc.def".to_string(), "xyz.def".to_string())]);
    }

    #[test]
    fn test_patch_set_longest_first() {
        let mut mapper = IdentifierMapper::new("seed");
        mapper.register("com.orig", "com.abcd").unwrap();
        mapper.register("com.orig.App.Share", "com.abcd.App.Share").unwrap();
        mapper.register("com.orig.App", "com.abcd.App").unwrap();

        let keys: Vec<_> = mapper.patch_set().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["com.orig.App.Share", "com.orig.App", "com.orig"]);
    }

    #[test]
    fn test_derive_nested_id_preserves_suffix() {
        assert_eq!(
            derive_nested_id("com.orig.App", "com.new.App", "com.orig.App.ext").as_deref(),
            Some("com.new.App.ext")
        );
        assert_eq!(
            derive_nested_id("com.orig.App", "com.new.App", "com.orig.App").as_deref(),
            Some("com.new.App")
        );
        assert_eq!(derive_nested_id("com.orig.App", "com.new.App", "com.orig.Apple"), None);
        assert_eq!(derive_nested_id("com.orig.App", "com.new.App", "org.other"), None);
    }
}
