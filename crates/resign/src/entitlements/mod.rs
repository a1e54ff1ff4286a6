//! Entitlement handling.
//!
//! Primary components (apps and extensions) are signed with a grant produced
//! by the [`EntitlementsResolver`]; every other component keeps its current
//! entitlements untouched.

pub mod capabilities;
pub mod grant;
pub mod profile;
pub mod remap;
pub mod resolver;

pub use grant::{CapabilityGrant, EntitlementKey, EntitlementValue, GeneratedGrant};
pub use profile::ProvisioningProfile;
pub use remap::{RemapDef, RemapPrefix, STANDARD_REMAPS};
pub use resolver::{register_team_mappings, EntitlementsResolver, ResolveMode, ResolverOptions};
