//! IPA archive handling.
//!
//! An `.ipa` is a ZIP archive holding `Payload/<Name>.app`, optionally next
//! to `SwiftSupport/` and other top-level folders. The pipeline extracts the
//! whole archive, signs the tree in place and packs it back up unchanged in
//! layout.
//!
//! # Examples
//!
//! ```no_run
//! use resign::ipa::{extract_archive, pack_tree, Compression};
//!
//! let work = tempfile::tempdir()?;
//! extract_archive("unsigned.ipa", work.path())?;
//! // ... sign work.path() ...
//! pack_tree(work.path(), "signed.ipa", Compression::default())?;
//! # Ok::<(), resign::Error>(())
//! ```

pub mod archive;
pub mod extract;

pub use archive::{pack_tree, Compression};
pub use extract::{check_archive, extract_archive};
