//! In-place identifier substitution in binaries and descriptors.
//!
//! Only equal-length pairs from [`IdentifierMapper::patch_set`] are applied,
//! so files are rewritten through a writable memory map without changing
//! their size or any offsets inside them.

use crate::bundle::BundleComponent;
use crate::ids::IdentifierMapper;
use crate::Result;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

/// Binary Patcher.
pub struct Patcher {
    patches: Vec<(String, String)>,
}

impl Patcher {
    pub fn new(mapper: &IdentifierMapper) -> Self {
        Self {
            patches: mapper.patch_set(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Files of `component` that carry identifiers: the component itself
    /// when it is a flat binary, its executable and its `Info.plist`.
    ///
    /// Bundles whose descriptor names no executable are assumed to use the
    /// bundle's own name.
    pub fn targets(component: &BundleComponent) -> Vec<PathBuf> {
        let mut targets = vec![component.path.clone()];
        match &component.executable {
            Some(executable) => targets.push(executable.clone()),
            None => {
                if let Some(stem) = component.path.file_stem() {
                    targets.push(component.path.join(stem));
                }
            }
        }
        if let Some(info) = &component.info_plist {
            targets.push(info.clone());
        }
        targets.into_iter().filter(|p| p.is_file()).collect()
    }

    /// Applies all substitutions to the files of `component`.
    ///
    /// Returns the number of replaced occurrences.
    pub fn patch_component(&self, component: &BundleComponent) -> Result<usize> {
        if self.is_empty() {
            tracing::info!(path = %component.path.display(), "Nothing to patch");
            return Ok(0);
        }
        let mut total = 0;
        for target in Self::targets(component) {
            total += self.patch_file(&target)?;
        }
        Ok(total)
    }

    /// Applies all substitutions to one file.
    pub fn patch_file(&self, path: &Path) -> Result<usize> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(0);
        }
        // SAFETY: the file is owned by the extracted tree and no other
        // process touches it while the pipeline runs.
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        let mut count = 0;
        for (old, new) in &self.patches {
            let n = replace_all(&mut map, old.as_bytes(), new.as_bytes());
            if n > 0 {
                tracing::debug!(path = %path.display(), old = %old, new = %new, count = n, "patched");
            }
            count += n;
        }
        if count > 0 {
            map.flush()?;
            tracing::info!(path = %path.display(), count, "patched identifiers");
        }
        Ok(count)
    }
}

/// Overwrites every non-overlapping occurrence of `old` with `new`.
fn replace_all(buf: &mut [u8], old: &[u8], new: &[u8]) -> usize {
    debug_assert_eq!(old.len(), new.len());
    if old.is_empty() || buf.len() < old.len() {
        return 0;
    }
    let mut count = 0;
    let mut i = 0;
    while i + old.len() <= buf.len() {
        if &buf[i..i + old.len()] == old {
            buf[i..i + old.len()].copy_from_slice(new);
            count += 1;
            i += old.len();
        } else {
            i += 1;
        }
    }
    count
}
