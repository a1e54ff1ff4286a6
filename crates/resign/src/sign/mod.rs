//! Signing of bundle components.
//!
//! The actual signature is produced by an external tool behind
//! [`CodeSigner`]. [`SigningCoordinator`] decides when each component may be
//! handed to it.

pub mod coordinator;
pub mod tool;

pub use coordinator::{LaunchHook, SigningCoordinator};
pub use tool::{parse_entitlements, CodeSigner, Codesign, SigningHandle};
