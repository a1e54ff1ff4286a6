//! Identifier assignment.
//!
//! [`IdentifierMapper`] owns every old→new substitution made during a run:
//! bundle identifiers, team prefixes and the identifiers embedded in
//! entitlement values (app groups, iCloud containers). Its final table is
//! logged for audit and drives the binary patcher.

pub mod mapper;
pub mod policy;

pub use mapper::{derive_nested_id, IdentifierMapper};
pub use policy::{resolve_main_id, BundleIdRequest, IdentifierStore, MainIdInputs};
