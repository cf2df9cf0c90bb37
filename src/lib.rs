//! Manifest signature verification for Kubernetes admission.
//!
//! Checks that an admitted resource carries a valid signature bundle and
//! that its content matches the signed manifest, tolerating the fields the
//! cluster is known to mutate.

pub mod admission;
pub mod bundle;
pub mod config;
pub mod crypto;
pub mod diff;
pub mod error;
pub mod pattern;
pub mod policy;
pub mod verifier;

pub use admission::AdmissionRequest;
pub use config::{DefaultConfig, EffectiveVerifyOptions, IgnoreFieldRule};
pub use diff::DiffResult;
pub use error::VerifyError;
pub use policy::{SignerKey, VerifyRule};
pub use verifier::{ManifestVerifier, VerificationOutcome};
