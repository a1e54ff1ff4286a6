//! Bundle re-signing pipeline.
//!
//! Takes an extracted application bundle tree and re-signs every component
//! (apps, extensions, frameworks, libraries, plugin bundles) under a new
//! identity, with consistently remapped identifiers and entitlements derived
//! for the new team.
//!
//! The heavy lifting is split into stages that each live in their own
//! module: [`bundle`] scanning, [`ids`] identifier mapping,
//! [`entitlements`] resolution, [`patch`] binary patching and [`sign`]
//! ordered signing. [`pipeline::Signer`] drives them over one tree and
//! [`runner::JobRunner`] wraps a whole remote job around it.
//!
//! # Example
//!
//! ```no_run
//! use resign::{SignOptions, Signer};
//!
//! let options = SignOptions::new("/tmp/extracted", "Apple Development: Jane (ABCDE12345)")
//!     .team_id("ABCDE12345")
//!     .account("jane@example.com", "app-specific-password")
//!     .encode_ids(true);
//! let report = Signer::new(options)?.sign()?;
//! println!("{} -> {}", report.original_bundle_id, report.main_bundle_id);
//! # Ok::<(), resign::Error>(())
//! ```

pub mod bundle;
pub mod entitlements;
pub mod error;
pub mod ids;
pub mod ipa;
pub mod keychain;
pub mod patch;
pub mod pipeline;
pub mod platform;
pub mod portal;
pub mod process;
pub mod progress;
pub mod remote;
pub mod runner;
pub mod sign;

pub use bundle::{BundleComponent, BundleTree, ComponentKind};
pub use entitlements::{CapabilityGrant, EntitlementsResolver};
pub use error::Error;
pub use ids::{BundleIdRequest, IdentifierMapper};
pub use pipeline::{SignOptions, SignReport, Signer, SigningContext};
pub use platform::Platform;
pub use runner::{JobRunner, RunnerConfig};

pub type Result<T> = std::result::Result<T, Error>;
