//! Repacking a signed tree into an archive.

use crate::Result;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// ZIP compression used when repacking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Store,
    /// Deflate at level 1-9.
    Deflate(u8),
}

impl Default for Compression {
    fn default() -> Self {
        Compression::Deflate(6)
    }
}

impl Compression {
    fn options(self) -> SimpleFileOptions {
        match self {
            Compression::Store => {
                SimpleFileOptions::default().compression_method(CompressionMethod::Stored)
            }
            Compression::Deflate(level) => SimpleFileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .compression_level(Some(i64::from(level.clamp(1, 9)))),
        }
    }
}

/// Archives everything under `root` into `output`, with paths relative to
/// `root` (so an extracted `Payload/` tree round-trips).
///
/// Symlinks are stored as links and Unix permissions are kept. Entries are
/// written in file name order. Returns the number of entries written.
pub fn pack_tree(root: impl AsRef<Path>, output: impl AsRef<Path>, compression: Compression) -> Result<usize> {
    let root = root.as_ref();
    let output = output.as_ref();
    if !root.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("not a directory: {}", root.display()),
        )
        .into());
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    let options = compression.options();
    let mut zip = ZipWriter::new(File::create(output)?);
    let mut count = 0;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name();
    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        // The output may live inside the tree being packed.
        if path == output {
            continue;
        }
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let file_type = entry.file_type();
        if file_type.is_symlink() {
            let link = fs::read_link(path)?;
            zip.add_symlink(name, link.to_string_lossy(), options)?;
        } else if file_type.is_dir() {
            zip.add_directory(format!("{name}/"), options)?;
        } else {
            zip.start_file(name, file_options(options, &entry.metadata()?))?;
            io::copy(&mut File::open(path)?, &mut zip)?;
        }
        count += 1;
    }

    zip.finish()?;
    tracing::info!(output = %output.display(), entries = count, "packed archive");
    Ok(count)
}

#[cfg(unix)]
fn file_options(options: SimpleFileOptions, metadata: &fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;
    options.unix_permissions(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn file_options(options: SimpleFileOptions, _metadata: &fs::Metadata) -> SimpleFileOptions {
    options
}
