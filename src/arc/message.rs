use base64::Engine;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::canonical::canonicalize_header;
use crate::common::dns::DnsResolver;
use crate::common::status::{VerifyResult, VerifyStatus};
use crate::crypto::{sign_headers, verify_signature, SignatureAlgorithm, SigningKey};
use crate::domainkey::{lookup_arc_domain_key, DomainKey, DomainKeyError};
use crate::header::{
    parse_canonicalization_pair, parse_header_field, remove_duplicates, strip_whitespace,
    wrap_signature,
};

use super::{ArcError, FORBIDDEN_HEADERS, MAX_INSTANCE};

/// An `ARC-Message-Signature` header: the DKIM shape minus the identity tag,
/// with an instance number instead.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArcMessageSignature {
    pub algorithm: Option<SignatureAlgorithm>,
    /// `b=` base64 signature.
    pub signature: String,
    /// `bh=` base64 body hash.
    pub body_hash: String,
    /// `c=` raw token; empty means `simple/simple`.
    pub canonicalization: String,
    pub domain: String,
    /// `h=` colon-separated header names.
    pub headers: String,
    /// `i=` instance number, 1–50.
    pub instance: u32,
    pub selector: String,
    pub timestamp: Option<i64>,
    /// The raw header line this was parsed from; empty for skeletons.
    pub raw_header: String,
}

impl ArcMessageSignature {
    /// Parse a raw `ARC-Message-Signature:` header line. The tag list is
    /// lenient: entries without `=` are skipped, unknown tags ignored.
    pub fn parse(line: &str) -> Result<Self, ArcError> {
        let (name, value) = parse_header_field(line);
        if !name.eq_ignore_ascii_case("arc-message-signature") {
            return Err(ArcError::InvalidHeaderField);
        }

        let mut ams = ArcMessageSignature {
            raw_header: line.to_string(),
            ..Default::default()
        };

        for field in value.split(';') {
            let Some((key, val)) = field.trim().split_once('=') else {
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            let val = strip_whitespace(val);
            match key.as_str() {
                "i" => {
                    let instance: u32 =
                        val.parse().map_err(|_| ArcError::InvalidInstanceNumber)?;
                    if instance == 0 || instance > MAX_INSTANCE {
                        return Err(ArcError::InvalidInstanceNumber);
                    }
                    ams.instance = instance;
                }
                "a" => {
                    ams.algorithm =
                        Some(SignatureAlgorithm::parse(&val).ok_or(ArcError::InvalidAlgorithm)?);
                }
                "b" => ams.signature = val,
                "bh" => ams.body_hash = val,
                "c" => ams.canonicalization = val,
                "d" => ams.domain = val,
                "h" => ams.headers = val,
                "s" => ams.selector = val,
                "t" => {
                    ams.timestamp = Some(val.parse().map_err(|_| ArcError::InvalidTimestamp)?);
                }
                _ => {}
            }
        }

        parse_canonicalization_pair(&ams.canonicalization)
            .map_err(|_| ArcError::InvalidCanonicalization)?;

        Ok(ams)
    }

    /// The header line as seen in the message, or the emission form for
    /// constructed values.
    pub fn raw(&self) -> String {
        if self.raw_header.is_empty() {
            self.header_string()
        } else {
            self.raw_header.clone()
        }
    }

    /// Render the header value in emission order (`i; a; c; d; s; h; bh; t;
    /// b`).
    pub fn value_string(&self) -> String {
        format!(
            "i={}; a={}; c={}; d={}; s={};\r\n        h={};\r\n        bh={}; t={};\r\n        b={}",
            self.instance,
            self.algorithm.map(|a| a.to_string()).unwrap_or_default(),
            self.canonicalization,
            self.domain,
            self.selector,
            self.headers,
            self.body_hash,
            self.timestamp.unwrap_or(0),
            wrap_signature(&self.signature),
        )
    }

    pub fn header_string(&self) -> String {
        format!("ARC-Message-Signature: {}\r\n", self.value_string())
    }

    /// Sign the message headers, filling `b=`.
    ///
    /// The `h=` list is set from the supplied header names with the ARC and
    /// Authentication-Results families excluded and duplicates removed. The
    /// AMS header itself is not part of its own signing input.
    pub fn sign(&mut self, headers: &[String], key: &SigningKey) -> Result<(), ArcError> {
        let mut names = Vec::new();
        for header in headers {
            if let Some((name, _)) = header.split_once(':') {
                let lower = name.trim().to_ascii_lowercase();
                if FORBIDDEN_HEADERS.contains(&lower.as_str()) {
                    continue;
                }
                names.push(name.to_string());
            }
        }
        let names = remove_duplicates(names);
        self.headers = names.join(":");

        let algorithm = match self.algorithm {
            Some(a) => a,
            None => {
                let a = key.default_algorithm();
                self.algorithm = Some(a);
                a
            }
        };
        if self.timestamp.is_none() {
            self.timestamp = Some(crate::dkim::unix_now());
        }
        let (canon_header, _) = parse_canonicalization_pair(&self.canonicalization)
            .map_err(|_| ArcError::InvalidCanonicalization)?;

        let signing_set = self.select_signing_headers(headers);
        self.signature = sign_headers(&signing_set, canon_header, key, algorithm, false)?;
        Ok(())
    }

    /// First matching header per `h=` name, in `h=` order.
    fn select_signing_headers(&self, headers: &[String]) -> Vec<String> {
        let mut selected = Vec::new();
        for name in self.headers.split(':') {
            let want = name.trim();
            for header in headers {
                if let Some((k, _)) = header.split_once(':') {
                    if k.trim().eq_ignore_ascii_case(want) {
                        selected.push(header.clone());
                        break;
                    }
                }
            }
        }
        selected
    }

    /// Verify this AMS against the message headers and body hash.
    pub fn verify(
        &self,
        headers: &[String],
        body_hash: &str,
        domain_key: &DomainKey,
    ) -> VerifyResult {
        for name in self.headers.split(':') {
            let lower = name.trim().to_ascii_lowercase();
            if FORBIDDEN_HEADERS.contains(&lower.as_str()) {
                return VerifyResult::new(
                    VerifyStatus::PermError,
                    format!("forbidden header {lower} found in h= tag"),
                );
            }
        }

        if self.raw_header.is_empty() {
            return VerifyResult::new(VerifyStatus::Neutral, "sign is not found");
        }

        let bh_matches: bool = self
            .body_hash
            .as_bytes()
            .ct_eq(body_hash.as_bytes())
            .into();
        if !bh_matches {
            return VerifyResult::new(VerifyStatus::Fail, "body hash is not match");
        }

        let Some(algorithm) = self.algorithm else {
            return VerifyResult::new(VerifyStatus::PermError, "invalid algorithm");
        };
        let Ok((canon_header, _)) = parse_canonicalization_pair(&self.canonicalization) else {
            return VerifyResult::new(VerifyStatus::PermError, "invalid canonicalization");
        };

        // Reconstruct the signing set with every AMS line removed.
        let filtered: Vec<String> = headers
            .iter()
            .filter(|h| {
                h.split_once(':')
                    .map(|(k, _)| !k.trim().eq_ignore_ascii_case("arc-message-signature"))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        let selected = self.select_signing_headers(&filtered);

        let mut input = String::new();
        for header in &selected {
            if let Some((k, _)) = header.split_once(':') {
                if k.trim().eq_ignore_ascii_case("arc-seal") {
                    return VerifyResult::new(VerifyStatus::PermError, "ARC-Seal is found");
                }
            }
            input.push_str(&canonicalize_header(header, canon_header));
        }
        // Exactly one trailing CRLF, matching the signing side.
        if let Some(stripped) = input.strip_suffix("\r\n") {
            input.truncate(stripped.len());
        }
        input.push_str("\r\n");

        let Ok(signature) = base64::engine::general_purpose::STANDARD.decode(&self.signature)
        else {
            return VerifyResult::new(VerifyStatus::PermError, "invalid signature");
        };

        let public_key = match domain_key.decode_public_key() {
            Ok(key) => key,
            Err(e) => {
                debug!(domain = %self.domain, selector = %self.selector, error = %e,
                       "public key decode failed");
                return VerifyResult::new(VerifyStatus::PermError, "invalid public key");
            }
        };

        if verify_signature(algorithm, &public_key, input.as_bytes(), &signature).is_err() {
            return VerifyResult::new(VerifyStatus::Fail, "invalid signature");
        }

        VerifyResult::new(VerifyStatus::Pass, "good signature")
    }

    /// Verify after retrieving the DomainKey over DNS.
    pub async fn verify_with_resolver<R: DnsResolver>(
        &self,
        headers: &[String],
        body_hash: &str,
        resolver: &R,
    ) -> VerifyResult {
        match lookup_arc_domain_key(resolver, &self.selector, &self.domain).await {
            Ok(domain_key) => self.verify(headers, body_hash, &domain_key),
            Err(DomainKeyError::NoRecord) => {
                VerifyResult::new(VerifyStatus::PermError, "domain key is not found")
            }
            Err(_) => VerifyResult::new(VerifyStatus::TempError, "failed to lookup domain key"),
        }
    }
}
