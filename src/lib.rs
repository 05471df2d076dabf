//! Email sender authentication: DKIM (RFC 6376), ARC (RFC 8617),
//! SPF (RFC 7208) and DMARC (RFC 7489) records.
//!
//! The crate is organized around the protocol engines and the machinery they
//! share: byte-exact canonicalization, a streaming body-hash accumulator,
//! header selection and tag-list parsing, and a pluggable DNS surface.
//! DNS caching is the caller's responsibility — implement
//! [`common::dns::DnsResolver`] with caching at the resolver layer if you
//! need it.

pub mod arc;
pub mod bodyhash;
pub mod canonical;
pub mod common;
pub mod crypto;
pub mod dkim;
pub mod dmarc;
pub mod domainkey;
pub mod header;
pub mod spf;

pub use common::status::{VerifyResult, VerifyStatus};
