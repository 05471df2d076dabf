use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::canonical::Canonicalization;
use crate::crypto::{sign_headers, SignatureAlgorithm, SigningKey};
use crate::header::{
    parse_canonicalization_pair, parse_header_field, strip_whitespace, wrap_signature,
};

use super::DkimError;

/// Recognized DKIM-Signature tags (RFC 6376 §3.5); everything else is
/// ignored.
const RECOGNIZED_TAGS: [&str; 14] = [
    "v", "a", "b", "bh", "c", "d", "h", "i", "l", "q", "s", "t", "x", "z",
];

const REQUIRED_TAGS: [&str; 7] = ["a", "b", "bh", "d", "h", "s", "v"];

const MAX_TAG_NAME_LEN: usize = 100;
const MAX_TAG_VALUE_LEN: usize = 1000;
const MAX_BODY_LIMIT: u64 = 1 << 32;

/// A DKIM-Signature header, either parsed from a message or built as a
/// skeleton for signing. Values are short-lived: a signature must not be
/// reused across message mutations.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Signature {
    /// `a=`; filled from the key type at signing time when unset.
    pub algorithm: Option<SignatureAlgorithm>,
    /// `b=` base64 signature, FWS-stripped.
    pub signature: String,
    /// `bh=` base64 body hash.
    pub body_hash: String,
    /// `c=` raw token, e.g. `relaxed/simple`; empty means `simple/simple`.
    pub canonicalization: String,
    /// `d=` signing domain.
    pub domain: String,
    /// `h=` colon-separated header names.
    pub headers: String,
    /// `i=` identity; defaults to `@<domain>`.
    pub identity: String,
    /// `l=` body length limit.
    pub limit: Option<u64>,
    /// `q=` query method; only `dns/txt` is defined.
    pub query_type: String,
    /// `s=` selector.
    pub selector: String,
    /// `t=` signing time, unix seconds.
    pub timestamp: Option<i64>,
    /// `v=`, must be 1.
    pub version: u32,
    /// `x=` expiration, unix seconds.
    pub expiration: Option<i64>,
    /// The raw header line this signature was parsed from; empty for
    /// skeletons built for signing.
    pub raw_header: String,
}

/// Strict tag-list parse for DKIM-Signature headers: duplicate tags fail
/// even when unrecognized, unrecognized tags are otherwise ignored, and the
/// required tag set is enforced.
fn parse_signature_params(value: &str) -> Result<Vec<(String, String)>, DkimError> {
    let mut params = Vec::new();
    let mut seen = HashSet::new();

    for pair in value.split(';') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let Some((key, val)) = pair.split_once('=') else {
            return Err(DkimError::MalformedHeaderParams);
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() || key.len() > MAX_TAG_NAME_LEN {
            return Err(DkimError::MalformedHeaderParams);
        }
        let val = val.trim();
        if val.len() > MAX_TAG_VALUE_LEN {
            return Err(DkimError::MalformedHeaderParams);
        }
        if !seen.insert(key.clone()) {
            return Err(DkimError::DuplicateTag(key));
        }
        if RECOGNIZED_TAGS.contains(&key.as_str()) {
            params.push((key, val.to_string()));
        }
    }

    for tag in REQUIRED_TAGS {
        if !params.iter().any(|(k, _)| k == tag) {
            return Err(DkimError::MissingRequiredTag(tag));
        }
    }
    Ok(params)
}

impl Signature {
    /// Parse a raw `DKIM-Signature:` header line.
    pub fn parse(line: &str) -> Result<Self, DkimError> {
        let (name, value) = parse_header_field(line);
        if !name.eq_ignore_ascii_case("dkim-signature") {
            return Err(DkimError::InvalidHeaderField);
        }

        let params = parse_signature_params(&value)?;

        let mut sig = Signature {
            raw_header: line.to_string(),
            ..Default::default()
        };

        for (key, val) in &params {
            let val = strip_whitespace(val);
            match key.as_str() {
                "v" => {
                    // The required-tag pass guarantees presence; the value
                    // must be the literal "1".
                    if val != "1" {
                        return Err(DkimError::InvalidVersion);
                    }
                    sig.version = 1;
                }
                "a" => {
                    sig.algorithm = Some(
                        SignatureAlgorithm::parse(&val).ok_or(DkimError::InvalidAlgorithm)?,
                    );
                }
                "b" => sig.signature = val,
                "bh" => sig.body_hash = val,
                "c" => {
                    parse_canonicalization_pair(&val)
                        .map_err(|_| DkimError::InvalidCanonicalization)?;
                    sig.canonicalization = val;
                }
                "d" => sig.domain = val,
                "h" => sig.headers = val,
                "i" => sig.identity = val,
                "l" => {
                    let limit: u64 = val.parse().map_err(|_| DkimError::InvalidBodyLimit)?;
                    if limit > MAX_BODY_LIMIT {
                        return Err(DkimError::InvalidBodyLimit);
                    }
                    sig.limit = Some(limit);
                }
                "q" => sig.query_type = val,
                "s" => sig.selector = val,
                "t" => {
                    sig.timestamp =
                        Some(val.parse().map_err(|_| DkimError::InvalidTimestamp)?);
                }
                "x" => {
                    sig.expiration =
                        Some(val.parse().map_err(|_| DkimError::InvalidExpiration)?);
                }
                "z" => {} // Copied headers are informational; passed through in raw.
                _ => {}
            }
        }

        if sig.query_type.is_empty() {
            sig.query_type = "dns/txt".to_string();
        }

        if sig.headers.is_empty() {
            return Err(DkimError::MissingFromHeader);
        }
        if !sig
            .headers
            .split(':')
            .any(|h| h.trim().eq_ignore_ascii_case("from"))
        {
            return Err(DkimError::MissingFromHeader);
        }

        if sig.identity.is_empty() {
            sig.identity = format!("@{}", sig.domain);
        } else if let Some(at) = sig.identity.rfind('@') {
            let identity_domain = &sig.identity[at + 1..];
            if identity_domain != sig.domain
                && !identity_domain.ends_with(&format!(".{}", sig.domain))
            {
                return Err(DkimError::IdentityMismatch);
            }
        }

        if let (Some(t), Some(x)) = (sig.timestamp, sig.expiration) {
            if x <= t {
                return Err(DkimError::ExpirationBeforeTimestamp);
            }
        }

        Ok(sig)
    }

    /// Header and body canonicalization from the `c=` tag.
    pub fn canonicalization_pair(
        &self,
    ) -> Result<(Canonicalization, Canonicalization), DkimError> {
        parse_canonicalization_pair(&self.canonicalization)
            .map_err(|_| DkimError::InvalidCanonicalization)
    }

    /// Render the header value in emission order (`a; bh; c; d; h; s; t; v;
    /// b`), folding with 8-space continuations and 9-space `b=` chunks.
    pub fn value_string(&self) -> String {
        let algorithm = self
            .algorithm
            .map(|a| a.to_string())
            .unwrap_or_default();
        format!(
            "a={}; bh={};\r\n        c={}; d={};\r\n        h={};\r\n        s={}; t={}; v={};\r\n        b={}",
            algorithm,
            self.body_hash,
            self.canonicalization,
            self.domain,
            self.headers,
            self.selector,
            self.timestamp.unwrap_or(0),
            self.version,
            wrap_signature(&self.signature),
        )
    }

    /// Complete `DKIM-Signature:` header line, ready to prepend to the
    /// message.
    pub fn header_string(&self) -> String {
        format!("DKIM-Signature: {}\r\n", self.value_string())
    }

    /// Sign the given CRLF-terminated header lines, filling `b=`.
    ///
    /// The `h=` list is set from the supplied header names in order and must
    /// cover a `From` header. The signature header itself is hashed with an
    /// empty `b=` and without its trailing CRLF (RFC 6376 §3.7).
    pub fn sign(&mut self, headers: &[String], key: &SigningKey) -> Result<(), DkimError> {
        if self.version != 1 {
            return Err(DkimError::InvalidVersion);
        }

        let mut names = Vec::new();
        for header in headers {
            if let Some((name, _)) = header.split_once(':') {
                names.push(name.to_string());
            }
        }
        if !names.iter().any(|n| n.trim().eq_ignore_ascii_case("from")) {
            return Err(DkimError::MissingFromHeader);
        }
        self.headers = names.join(":");

        if self.timestamp.is_none() {
            self.timestamp = Some(unix_now());
        }
        let algorithm = match self.algorithm {
            Some(a) => a,
            None => {
                let a = key.default_algorithm();
                self.algorithm = Some(a);
                a
            }
        };
        let (canon_header, _) = self.canonicalization_pair()?;

        self.signature.clear();
        let mut signing_set: Vec<String> = headers.to_vec();
        signing_set.push(format!("DKIM-Signature: {}", self.value_string()));

        self.signature = sign_headers(&signing_set, canon_header, key, algorithm, true)?;
        Ok(())
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
