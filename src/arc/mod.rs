//! ARC (RFC 8617): per-instance AAR/AMS/AS triplets, the seal-over-prior-sets
//! protocol and chain validation.

mod chain;
mod message;
mod results;
mod seal;

use thiserror::Error;

pub use chain::{collect_sets, verify_chain, ArcSet};
pub use message::ArcMessageSignature;
pub use results::ArcAuthenticationResults;
pub use seal::{ArcSeal, ChainValidation};

/// Highest instance number a relay may add (RFC 8617 §4.2.1).
pub const MAX_INSTANCE: u32 = 50;

/// Headers that must never appear in an AMS `h=` list, and that AMS signing
/// excludes from its defaults.
pub(crate) const FORBIDDEN_HEADERS: [&str; 4] = [
    "authentication-results",
    "arc-authentication-results",
    "arc-message-signature",
    "arc-seal",
];

pub(crate) const ARC_SET_HEADERS: [&str; 3] = [
    "ARC-Authentication-Results",
    "ARC-Message-Signature",
    "ARC-Seal",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArcError {
    #[error("invalid header field")]
    InvalidHeaderField,
    #[error("invalid instance number")]
    InvalidInstanceNumber,
    #[error("invalid algorithm")]
    InvalidAlgorithm,
    #[error("invalid canonicalization")]
    InvalidCanonicalization,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("invalid chain validation result")]
    InvalidChainValidation,
    #[error("forbidden tag {0:?} in ARC-Seal header")]
    ForbiddenTag(String),
    #[error("missing ARC headers for instance {0}")]
    MissingInstance(u32),
    #[error(transparent)]
    Sign(#[from] crate::crypto::SignError),
}
