//! DKIM (RFC 6376): signature parsing, signing and verification.

mod signature;
mod verify;

use thiserror::Error;

pub use signature::Signature;
pub(crate) use signature::unix_now;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DkimError {
    #[error("invalid header field")]
    InvalidHeaderField,
    #[error("malformed header params")]
    MalformedHeaderParams,
    #[error("duplicate tag {0:?} in DKIM-Signature header")]
    DuplicateTag(String),
    #[error("required tag {0:?} is missing in DKIM-Signature header")]
    MissingRequiredTag(&'static str),
    #[error("invalid version")]
    InvalidVersion,
    #[error("invalid algorithm")]
    InvalidAlgorithm,
    #[error("invalid canonicalization")]
    InvalidCanonicalization,
    #[error("invalid timestamp")]
    InvalidTimestamp,
    #[error("invalid signature expiration")]
    InvalidExpiration,
    #[error("invalid body limit")]
    InvalidBodyLimit,
    #[error("h= tag must include the From header")]
    MissingFromHeader,
    #[error("i= tag domain must be the same as or a subdomain of d= tag domain")]
    IdentityMismatch,
    #[error("x= tag value must be greater than t= tag value")]
    ExpirationBeforeTimestamp,
    #[error(transparent)]
    Sign(#[from] crate::crypto::SignError),
}
