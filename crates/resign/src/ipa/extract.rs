//! Archive extraction.

use crate::{Error, Result};
use memmap2::Mmap;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// One file or symlink to materialize.
struct Planned {
    index: usize,
    target: PathBuf,
    mode: Option<u32>,
}

impl Planned {
    fn is_symlink(&self) -> bool {
        cfg!(unix) && self.mode.map(|m| m & S_IFMT == S_IFLNK).unwrap_or(false)
    }
}

/// Extracts every entry of `archive` under `dest`.
///
/// Files are written in parallel from a memory map of the archive. Unix
/// permissions and symlinks are restored; entries whose names would escape
/// `dest` are skipped. Returns the number of files and links written.
pub fn extract_archive(archive: impl AsRef<Path>, dest: impl AsRef<Path>) -> Result<usize> {
    let archive = archive.as_ref();
    let dest = dest.as_ref();
    check_archive(archive)?;

    let file = File::open(archive)?;
    // Read-only map; the archive is not modified while extracting.
    let map = unsafe { Mmap::map(&file)? };
    let mut zip = ZipArchive::new(Cursor::new(&map[..]))?;

    let mut dirs = BTreeSet::new();
    dirs.insert(dest.to_path_buf());
    let mut planned = Vec::with_capacity(zip.len());
    for index in 0..zip.len() {
        let entry = zip.by_index(index)?;
        let Some(name) = entry.enclosed_name() else {
            tracing::warn!(name = entry.name(), "skipping archive entry outside destination");
            continue;
        };
        let target = dest.join(name);
        if entry.is_dir() {
            dirs.insert(target);
            continue;
        }
        if let Some(parent) = target.parent() {
            dirs.insert(parent.to_path_buf());
        }
        planned.push(Planned {
            index,
            target,
            mode: entry.unix_mode(),
        });
    }

    for dir in &dirs {
        fs::create_dir_all(dir)?;
    }

    planned.par_iter().try_for_each(|item| -> Result<()> {
        let mut zip = ZipArchive::new(Cursor::new(&map[..]))?;
        let mut entry = zip.by_index(item.index)?;

        if item.is_symlink() {
            let mut link = String::new();
            entry.read_to_string(&mut link)?;
            write_symlink(&link, &item.target)?;
            return Ok(());
        }

        let mut out = File::create(&item.target)?;
        io::copy(&mut entry, &mut out)?;
        set_mode(&item.target, item.mode)?;
        Ok(())
    })?;

    tracing::info!(archive = %archive.display(), files = planned.len(), "extracted");
    Ok(planned.len())
}

/// Checks that `path` exists and starts with a ZIP signature.
pub fn check_archive(path: &Path) -> Result<()> {
    let mut magic = [0u8; 2];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| {
            Error::Io(io::Error::new(
                e.kind(),
                format!("cannot read archive {}: {e}", path.display()),
            ))
        })?;
    if &magic != b"PK" {
        return Err(Error::Zip(zip::result::ZipError::InvalidArchive(
            "not a ZIP archive".into(),
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn write_symlink(link: &str, target: &Path) -> Result<()> {
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_symlink(_link: &str, _target: &Path) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}
