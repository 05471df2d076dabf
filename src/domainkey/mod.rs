//! DomainKey records: the `<selector>._domainkey.<domain>` TXT record shared
//! by DKIM and ARC, and decoding of the public key carried in `p=`.

use base64::Engine;
use thiserror::Error;
use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver};
use crate::crypto::PublicKey;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainKeyError {
    #[error("no record found")]
    NoRecord,
    #[error("dns lookup failed: {0}")]
    LookupFailed(String),
    #[error("invalid hash algorithm")]
    InvalidHashAlgo,
    #[error("invalid key type")]
    InvalidKeyType,
    #[error("invalid service type")]
    InvalidServiceType,
    #[error("invalid version")]
    InvalidVersion,
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgo {
    Sha1,
    Sha256,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    #[default]
    Rsa,
    Ed25519,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    Email,
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorFlag {
    /// `t=y`: the domain is testing DKIM.
    Testing,
    /// `t=s`: the `i=` domain must not be a subdomain of `d=`.
    StrictDomain,
}

/// Parsed DomainKey TXT record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DomainKey {
    /// `h=` acceptable hash algorithms; empty means unconstrained.
    pub hash_algo: Vec<HashAlgo>,
    /// `k=` key type, `rsa` when absent.
    pub key_type: KeyType,
    /// `n=` notes.
    pub notes: String,
    /// `p=` base64 public key; empty means the key was revoked.
    pub public_key: String,
    /// `s=` service types; empty means all services.
    pub service_type: Vec<ServiceType>,
    /// `t=` flags.
    pub selector_flags: Vec<SelectorFlag>,
    /// `v=` version string, normally `DKIM1`.
    pub version: String,
    raw: String,
}

impl DomainKey {
    /// Parse a DomainKey TXT record. Unknown tags and unknown `t=` flags are
    /// ignored; out-of-range `h=`, `k=`, `s=` entries are errors.
    pub fn parse(record: &str) -> Result<Self, DomainKeyError> {
        let mut key = DomainKey {
            raw: record.to_string(),
            ..Default::default()
        };

        for pair in record.split(';') {
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };
            match k.to_ascii_lowercase().as_str() {
                "v" => key.version = v.to_string(),
                "h" => {
                    for algo in v.split(':') {
                        match algo.trim() {
                            "sha1" => key.hash_algo.push(HashAlgo::Sha1),
                            "sha256" => key.hash_algo.push(HashAlgo::Sha256),
                            _ => return Err(DomainKeyError::InvalidHashAlgo),
                        }
                    }
                }
                "k" => {
                    for kty in v.split(':') {
                        match kty.trim() {
                            "rsa" => key.key_type = KeyType::Rsa,
                            "ed25519" => key.key_type = KeyType::Ed25519,
                            _ => return Err(DomainKeyError::InvalidKeyType),
                        }
                    }
                }
                "n" => key.notes = v.to_string(),
                "p" => key.public_key = v.replace(' ', ""),
                "s" => {
                    for svc in v.split(':') {
                        match svc.trim() {
                            "email" => key.service_type.push(ServiceType::Email),
                            "*" => key.service_type.push(ServiceType::All),
                            _ => return Err(DomainKeyError::InvalidServiceType),
                        }
                    }
                }
                "t" => {
                    for flag in v.split(':') {
                        match flag.trim() {
                            "y" => key.selector_flags.push(SelectorFlag::Testing),
                            "s" => key.selector_flags.push(SelectorFlag::StrictDomain),
                            // Unknown flags are reserved for future use.
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(key)
    }

    pub fn is_test_flag(&self) -> bool {
        self.selector_flags.contains(&SelectorFlag::Testing)
    }

    /// Whether this key may be used for the given service. An empty `s=`
    /// list permits every service.
    pub fn is_service(&self, service: ServiceType) -> bool {
        if service == ServiceType::All || self.service_type.is_empty() {
            return true;
        }
        self.service_type
            .iter()
            .any(|s| *s == service || *s == ServiceType::All)
    }

    /// Base64-decode `p=` and interpret it according to `k=`.
    pub fn decode_public_key(&self) -> Result<PublicKey, DomainKeyError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(&self.public_key)
            .map_err(|e| DomainKeyError::InvalidPublicKey(format!("invalid base64: {e}")))?;
        decode_public_key(&decoded, self.key_type)
    }

    fn is_revoked(&self) -> bool {
        self.raw.contains("p=") && self.public_key.is_empty()
    }
}

/// Decode public key bytes from a DomainKey `p=` tag.
///
/// RFC 6376 publishes RSA keys as PKCS#1 `RSAPublicKey` DER;
/// SubjectPublicKeyInfo is accepted as a fallback for interoperability.
/// RFC 8463 publishes Ed25519 keys as the raw 32-octet key, with SPKI again
/// accepted as a fallback.
pub fn decode_public_key(decoded: &[u8], key_type: KeyType) -> Result<PublicKey, DomainKeyError> {
    match key_type {
        KeyType::Rsa => {
            if looks_like_pkcs1_rsa(decoded) {
                return Ok(PublicKey::Rsa(decoded.to_vec()));
            }
            let (oid_ok, bits) = parse_spki(decoded, Spki::Rsa)?;
            if !oid_ok {
                return Err(DomainKeyError::InvalidPublicKey(
                    "not an RSA public key".to_string(),
                ));
            }
            Ok(PublicKey::Rsa(bits))
        }
        KeyType::Ed25519 => {
            if decoded.len() == 32 {
                let mut raw = [0u8; 32];
                raw.copy_from_slice(decoded);
                return Ok(PublicKey::Ed25519(raw));
            }
            let (oid_ok, bits) = parse_spki(decoded, Spki::Ed25519)?;
            if !oid_ok || bits.len() != 32 {
                return Err(DomainKeyError::InvalidPublicKey(
                    "not an Ed25519 public key".to_string(),
                ));
            }
            let mut raw = [0u8; 32];
            raw.copy_from_slice(&bits);
            Ok(PublicKey::Ed25519(raw))
        }
    }
}

/// Shallow DER probe: a PKCS#1 RSAPublicKey is a SEQUENCE of exactly two
/// INTEGERs (modulus, exponent).
fn looks_like_pkcs1_rsa(der: &[u8]) -> bool {
    use x509_parser::der_parser::ber::Tag;
    match x509_parser::der_parser::parse_der(der) {
        Ok((rem, obj)) if rem.is_empty() => match obj.as_sequence() {
            Ok(items) => {
                items.len() == 2 && items.iter().all(|o| o.header.tag() == Tag::Integer)
            }
            Err(_) => false,
        },
        _ => false,
    }
}

enum Spki {
    Rsa,
    Ed25519,
}

fn parse_spki(der: &[u8], expected: Spki) -> Result<(bool, Vec<u8>), DomainKeyError> {
    use x509_parser::oid_registry::{OID_PKCS1_RSAENCRYPTION, OID_SIG_ED25519};
    use x509_parser::prelude::FromDer;
    use x509_parser::x509::SubjectPublicKeyInfo;

    let (_, spki) = SubjectPublicKeyInfo::from_der(der)
        .map_err(|e| DomainKeyError::InvalidPublicKey(format!("SPKI parse: {e}")))?;
    let oid_ok = match expected {
        Spki::Rsa => spki.algorithm.algorithm == OID_PKCS1_RSAENCRYPTION,
        Spki::Ed25519 => spki.algorithm.algorithm == OID_SIG_ED25519,
    };
    let bits: &[u8] = &spki.subject_public_key.data;
    Ok((oid_ok, bits.to_vec()))
}

fn domainkey_query(selector: &str, domain: &str) -> String {
    format!("{selector}._domainkey.{domain}")
}

async fn lookup_domain_key<R: DnsResolver>(
    resolver: &R,
    selector: &str,
    domain: &str,
) -> Result<DomainKey, DomainKeyError> {
    let query = domainkey_query(selector, domain);
    let records = match resolver.query_txt(&query).await {
        Ok(records) => records,
        Err(DnsError::NotFound) => return Err(DomainKeyError::NoRecord),
        Err(e) => return Err(DomainKeyError::LookupFailed(e.to_string())),
    };

    for record in &records {
        let key = DomainKey::parse(record)?;
        if !key.public_key.is_empty() {
            debug!(name = %query, "found domain key");
            return Ok(key);
        }
        if key.is_revoked() {
            // An empty p= tag means the key was deliberately revoked.
            return Err(DomainKeyError::NoRecord);
        }
    }
    Err(DomainKeyError::NoRecord)
}

/// Look up the DomainKey used by a DKIM signature. `v=` must be `DKIM1` when
/// present.
pub async fn lookup_dkim_domain_key<R: DnsResolver>(
    resolver: &R,
    selector: &str,
    domain: &str,
) -> Result<DomainKey, DomainKeyError> {
    let key = lookup_domain_key(resolver, selector, domain).await?;
    if !key.version.is_empty() && key.version != "DKIM1" {
        return Err(DomainKeyError::InvalidVersion);
    }
    Ok(key)
}

/// Look up the DomainKey used by an ARC signature; the version tag is not
/// required.
pub async fn lookup_arc_domain_key<R: DnsResolver>(
    resolver: &R,
    selector: &str,
    domain: &str,
) -> Result<DomainKey, DomainKeyError> {
    lookup_domain_key(resolver, selector, domain).await
}
