//! App bundle discovery and metadata handling.
//!
//! This module provides functionality to:
//! - Find the main application inside an extracted tree
//! - Enumerate nested components (extensions, frameworks, libraries, plugins)
//!   in leaf-first signing order
//! - Read and rewrite `Info.plist` descriptors
//!
//! # Signing order
//!
//! A container's signature seals the signatures of everything nested inside
//! it, so components are returned deepest-first with the main application
//! last:
//!
//! | Kind | Pattern | Primary |
//! |------|---------|---------|
//! | [`ComponentKind::MainApp`] | `**/*.app` | yes |
//! | [`ComponentKind::Extension`] | `**/*.appex` | yes |
//! | [`ComponentKind::Framework`] | `**/*.framework` | no |
//! | [`ComponentKind::Library`] | `**/*.dylib` | no |
//! | [`ComponentKind::PluginBundle`] | `**/PlugIns/*.bundle` | no |
//!
//! # Examples
//!
//! ```no_run
//! use resign::bundle::BundleTree;
//!
//! let tree = BundleTree::scan("/tmp/extracted")?;
//! for component in &tree.components {
//!     println!("{:?} {}", component.kind, component.path.display());
//! }
//! # Ok::<(), resign::Error>(())
//! ```

pub mod info;
pub mod scanner;

pub use info::{find_info_plist, InfoPatches, InfoPlist};
pub use scanner::{find_main_app, BundleComponent, BundleTree, ComponentKind};
