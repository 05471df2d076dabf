use base64::Engine;
use tracing::debug;

use crate::canonical::{canonicalize_header, Canonicalization};
use crate::common::dns::DnsResolver;
use crate::common::status::{VerifyResult, VerifyStatus};
use crate::crypto::{sign_headers, verify_signature, SignatureAlgorithm, SigningKey};
use crate::domainkey::{lookup_arc_domain_key, DomainKey, DomainKeyError};
use crate::header::{
    delete_signature_value, extract_headers_all, parse_header_field, strip_whitespace,
    wrap_signature,
};

use super::chain::collect_builders;
use super::{ArcError, ARC_SET_HEADERS, MAX_INSTANCE};

/// Chain validation state carried in the `cv=` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChainValidation {
    /// Legal only on the first instance.
    #[default]
    None,
    Pass,
    Fail,
}

impl ChainValidation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(ChainValidation::None),
            "pass" => Some(ChainValidation::Pass),
            "fail" => Some(ChainValidation::Fail),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChainValidation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainValidation::None => f.write_str("none"),
            ChainValidation::Pass => f.write_str("pass"),
            ChainValidation::Fail => f.write_str("fail"),
        }
    }
}

/// An `ARC-Seal` header. Seals carry no `h=`/`bh=`: they sign the ARC sets
/// themselves, not the message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ArcSeal {
    pub algorithm: Option<SignatureAlgorithm>,
    /// `b=` base64 signature.
    pub signature: String,
    /// `cv=` chain validation state.
    pub chain_validation: ChainValidation,
    pub domain: String,
    /// `i=` instance number, 1–50.
    pub instance: u32,
    pub selector: String,
    pub timestamp: Option<i64>,
    /// The raw header line this was parsed from; empty for skeletons.
    pub raw_header: String,
}

impl ArcSeal {
    /// Parse a raw `ARC-Seal:` header line.
    ///
    /// A `h=` or `bh=` tag is forbidden by RFC 8617 §5.1.1 and forces
    /// `cv=fail` on the parsed value rather than aborting the parse; use
    /// [`parse_strict`](Self::parse_strict) to reject such input outright.
    pub fn parse(line: &str) -> Result<Self, ArcError> {
        Self::parse_inner(line, false)
    }

    /// Like [`parse`](Self::parse), but a forbidden `h=`/`bh=` tag is an
    /// error instead of a forced `cv=fail`.
    pub fn parse_strict(line: &str) -> Result<Self, ArcError> {
        Self::parse_inner(line, true)
    }

    fn parse_inner(line: &str, strict: bool) -> Result<Self, ArcError> {
        let (name, value) = parse_header_field(line);
        if !name.eq_ignore_ascii_case("arc-seal") {
            return Err(ArcError::InvalidHeaderField);
        }

        let mut seal = ArcSeal {
            raw_header: line.to_string(),
            ..Default::default()
        };

        for field in value.split(';') {
            let Some((key, val)) = field.trim().split_once('=') else {
                continue;
            };
            let key = key.trim();
            let val = strip_whitespace(val);

            if key == "h" || key == "bh" {
                if strict {
                    return Err(ArcError::ForbiddenTag(key.to_string()));
                }
                seal.chain_validation = ChainValidation::Fail;
                continue;
            }

            match key {
                "i" => {
                    let instance: u32 =
                        val.parse().map_err(|_| ArcError::InvalidInstanceNumber)?;
                    if instance == 0 || instance > MAX_INSTANCE {
                        return Err(ArcError::InvalidInstanceNumber);
                    }
                    seal.instance = instance;
                }
                "a" => {
                    seal.algorithm =
                        Some(SignatureAlgorithm::parse(&val).ok_or(ArcError::InvalidAlgorithm)?);
                }
                "b" => seal.signature = val,
                "d" => seal.domain = val,
                "s" => seal.selector = val,
                "t" => {
                    seal.timestamp = Some(val.parse().map_err(|_| ArcError::InvalidTimestamp)?);
                }
                "cv" => {
                    // A forbidden tag earlier in the list pins cv to fail.
                    let parsed =
                        ChainValidation::parse(&val).ok_or(ArcError::InvalidChainValidation)?;
                    if seal.chain_validation != ChainValidation::Fail {
                        seal.chain_validation = parsed;
                    }
                }
                _ => {}
            }
        }

        Ok(seal)
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

    /// Render the header value in emission order (`i; a; t; cv; d; s; b`).
    pub fn value_string(&self) -> String {
        format!(
            "i={}; a={}; t={}; cv={};\r\n        d={}; s={};\r\n        b={}",
            self.instance,
            self.algorithm.map(|a| a.to_string()).unwrap_or_default(),
            self.timestamp.unwrap_or(0),
            self.chain_validation,
            self.domain,
            self.selector,
            wrap_signature(&self.signature),
        )
    }

    /// The value with an empty `b=`, as hashed during sealing.
    fn value_string_unsigned(&self) -> String {
        format!(
            "i={}; a={}; t={}; cv={};\r\n        d={}; s={};\r\n        b=",
            self.instance,
            self.algorithm.map(|a| a.to_string()).unwrap_or_default(),
            self.timestamp.unwrap_or(0),
            self.chain_validation,
            self.domain,
            self.selector,
        )
    }

    pub fn header_string(&self) -> String {
        format!("ARC-Seal: {}\r\n", self.value_string())
    }

    /// Seal the chain at this seal's instance number.
    ///
    /// The signing set is, in order: the complete AAR/AMS/AS triple of every
    /// prior instance, the current instance's AAR and AMS, and this seal
    /// with an empty `b=` and no trailing CRLF. Any missing member aborts.
    /// Seals always use relaxed canonicalization.
    pub fn sign(&mut self, headers: &[String], key: &SigningKey) -> Result<(), ArcError> {
        if self.timestamp.is_none() {
            self.timestamp = Some(crate::dkim::unix_now());
        }
        let algorithm = match self.algorithm {
            Some(a) => a,
            None => {
                let a = key.default_algorithm();
                self.algorithm = Some(a);
                a
            }
        };

        let arc_names: Vec<String> = ARC_SET_HEADERS.iter().map(|s| s.to_string()).collect();
        let extracted = extract_headers_all(headers, &arc_names);
        let sets = collect_builders(&extracted)?;

        let mut signing_set = Vec::new();
        for i in 1..self.instance {
            let set = sets.get(&i).ok_or(ArcError::MissingInstance(i))?;
            let (Some(aar), Some(ams), Some(seal)) = (&set.aar, &set.ams, &set.seal) else {
                return Err(ArcError::MissingInstance(i));
            };
            signing_set.push(aar.raw());
            signing_set.push(ams.raw());
            signing_set.push(seal.raw());
        }

        let current = sets
            .get(&self.instance)
            .ok_or(ArcError::MissingInstance(self.instance))?;
        let (Some(aar), Some(ams)) = (&current.aar, &current.ams) else {
            return Err(ArcError::MissingInstance(self.instance));
        };
        signing_set.push(aar.raw());
        signing_set.push(ams.raw());

        self.signature.clear();
        signing_set.push(format!("ARC-Seal: {}\r\n", self.value_string_unsigned()));

        self.signature = sign_headers(
            &signing_set,
            Canonicalization::Relaxed,
            key,
            algorithm,
            true,
        )?;
        Ok(())
    }

    /// Verify this seal against the ARC sets present in `headers`.
    ///
    /// `headers` must contain only the ARC sets covered by this seal
    /// (instances up to and including its own); the chain verifier slices
    /// the message accordingly.
    pub fn verify(&self, headers: &[String], domain_key: &DomainKey) -> VerifyResult {
        if self.chain_validation == ChainValidation::Fail {
            return VerifyResult::new(VerifyStatus::Fail, "chain validation result is fail");
        }

        if self.raw_header.is_empty() {
            return VerifyResult::new(VerifyStatus::Neutral, "seal is not found");
        }

        let Some(algorithm) = self.algorithm else {
            return VerifyResult::new(VerifyStatus::PermError, "invalid algorithm");
        };

        let arc_names: Vec<String> = ARC_SET_HEADERS.iter().map(|s| s.to_string()).collect();
        let mut extracted = extract_headers_all(headers, &arc_names);
        // The blanked copy of this seal replaces the signed one during set
        // collection (later entries win).
        extracted.push(delete_signature_value(&self.raw_header));

        let Ok(sets) = collect_builders(&extracted) else {
            return VerifyResult::new(VerifyStatus::PermError, "failed to parse arc headers");
        };

        let mut input = String::new();
        for set in sets.values() {
            if let (Some(aar), Some(ams), Some(seal)) = (&set.aar, &set.ams, &set.seal) {
                input.push_str(&canonicalize_header(&aar.raw(), Canonicalization::Relaxed));
                input.push_str(&canonicalize_header(&ams.raw(), Canonicalization::Relaxed));
                input.push_str(&canonicalize_header(&seal.raw(), Canonicalization::Relaxed));
            }
        }
        if let Some(stripped) = input.strip_suffix("\r\n") {
            input.truncate(stripped.len());
        }

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
        resolver: &R,
    ) -> VerifyResult {
        match lookup_arc_domain_key(resolver, &self.selector, &self.domain).await {
            Ok(domain_key) => self.verify(headers, &domain_key),
            Err(DomainKeyError::NoRecord) => {
                VerifyResult::new(VerifyStatus::PermError, "domain key is not found")
            }
            Err(_) => VerifyResult::new(VerifyStatus::TempError, "failed to lookup domain key"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arc::message::tests::{ed25519_domain_key, ed25519_key};
    use crate::arc::ArcMessageSignature;

    fn seal_line(extra: &str) -> String {
        format!(
            "ARC-Seal: i=1; a=rsa-sha256; t=12345; cv=none;{extra}\r\n\
             \x20       d=example.org; s=selector;\r\n\
             \x20       b=signature"
        )
    }

    // --- parsing ---

    #[test]
    fn parse_basic() {
        let seal = ArcSeal::parse(&seal_line("")).unwrap();
        assert_eq!(seal.instance, 1);
        assert_eq!(seal.algorithm, Some(SignatureAlgorithm::RsaSha256));
        assert_eq!(seal.timestamp, Some(12345));
        assert_eq!(seal.chain_validation, ChainValidation::None);
        assert_eq!(seal.domain, "example.org");
        assert_eq!(seal.selector, "selector");
        assert_eq!(seal.signature, "signature");
    }

    #[test]
    fn parse_forbidden_h_tag_forces_cv_fail() {
        let seal = ArcSeal::parse(&seal_line(" h=From:To;")).unwrap();
        assert_eq!(seal.chain_validation, ChainValidation::Fail);
    }

    #[test]
    fn parse_forbidden_bh_tag_forces_cv_fail() {
        let seal = ArcSeal::parse(&seal_line(" bh=bodyhash;")).unwrap();
        assert_eq!(seal.chain_validation, ChainValidation::Fail);
    }

    #[test]
    fn parse_forbidden_tag_before_cv_still_fails() {
        // cv=none appears after the forbidden tag; fail must stick.
        let line = "ARC-Seal: i=1; a=rsa-sha256; h=From; t=12345; cv=none; \
                    d=example.org; s=sel; b=sig";
        let seal = ArcSeal::parse(line).unwrap();
        assert_eq!(seal.chain_validation, ChainValidation::Fail);
    }

    #[test]
    fn parse_strict_rejects_forbidden_tags() {
        assert_eq!(
            ArcSeal::parse_strict(&seal_line(" h=From:To;")),
            Err(ArcError::ForbiddenTag("h".to_string()))
        );
        assert_eq!(
            ArcSeal::parse_strict(&seal_line(" bh=hash;")),
            Err(ArcError::ForbiddenTag("bh".to_string()))
        );
        assert!(ArcSeal::parse_strict(&seal_line("")).is_ok());
    }

    #[test]
    fn parse_invalid_cv_fails() {
        let line = "ARC-Seal: i=1; a=rsa-sha256; t=1; cv=maybe; d=example.org; s=sel; b=sig";
        assert_eq!(
            ArcSeal::parse(line),
            Err(ArcError::InvalidChainValidation)
        );
    }

    // --- sealing ---

    fn chain_instance_1(body_hash: &str) -> Vec<String> {
        let key = ed25519_key();
        let message = vec![
            "From: alice@example.com\r\n".to_string(),
            "To: bob@example.com\r\n".to_string(),
            "Subject: Test\r\n".to_string(),
        ];

        let mut ams = ArcMessageSignature {
            instance: 1,
            canonicalization: "relaxed/relaxed".to_string(),
            domain: "example.com".to_string(),
            selector: "selector".to_string(),
            timestamp: Some(1728300596),
            body_hash: body_hash.to_string(),
            ..Default::default()
        };
        ams.sign(&message, &key).unwrap();

        let mut headers = message;
        headers.push("ARC-Authentication-Results: i=1; spf=pass\r\n".to_string());
        headers.push(ams.header_string());
        headers
    }

    #[test]
    fn seal_signs_over_current_set() {
        let headers = chain_instance_1("bodyhash");
        let mut seal = ArcSeal {
            instance: 1,
            chain_validation: ChainValidation::None,
            domain: "example.com".to_string(),
            selector: "selector".to_string(),
            timestamp: Some(1728300600),
            ..Default::default()
        };
        seal.sign(&headers, &ed25519_key()).unwrap();
        assert!(!seal.signature.is_empty());

        // Round-trip: parse the emitted seal and verify it over the set.
        let mut sealed = headers;
        sealed.push(seal.header_string());
        let parsed = ArcSeal::parse(&seal.header_string()).unwrap();
        let result = parsed.verify(&sealed, &ed25519_domain_key());
        assert_eq!(result.status(), VerifyStatus::Pass, "{}", result.message());
    }

    #[test]
    fn seal_missing_current_set_aborts() {
        let headers = vec!["From: alice@example.com\r\n".to_string()];
        let mut seal = ArcSeal {
            instance: 1,
            ..Default::default()
        };
        assert_eq!(
            seal.sign(&headers, &ed25519_key()),
            Err(ArcError::MissingInstance(1))
        );
    }

    #[test]
    fn seal_missing_prior_set_aborts() {
        // Instance 2 seal with no instance-1 triple present.
        let headers = chain_instance_1("bodyhash")
            .into_iter()
            .map(|h| h.replace("i=1", "i=2"))
            .collect::<Vec<_>>();
        let mut seal = ArcSeal {
            instance: 2,
            ..Default::default()
        };
        assert_eq!(
            seal.sign(&headers, &ed25519_key()),
            Err(ArcError::MissingInstance(1))
        );
    }

    #[test]
    fn verify_presented_cv_fail_short_circuits() {
        let seal = ArcSeal {
            chain_validation: ChainValidation::Fail,
            ..Default::default()
        };
        let result = seal.verify(&[], &ed25519_domain_key());
        assert_eq!(result.status(), VerifyStatus::Fail);
        assert_eq!(result.message(), "chain validation result is fail");
    }

    #[test]
    fn verify_corrupted_seal_fails() {
        let headers = chain_instance_1("bodyhash");
        let mut seal = ArcSeal {
            instance: 1,
            chain_validation: ChainValidation::None,
            domain: "example.com".to_string(),
            selector: "selector".to_string(),
            timestamp: Some(1728300600),
            ..Default::default()
        };
        seal.sign(&headers, &ed25519_key()).unwrap();

        // Corrupt one AAR byte after sealing.
        let mut sealed: Vec<String> = headers
            .iter()
            .map(|h| h.replace("spf=pass", "spf=fail"))
            .collect();
        sealed.push(seal.header_string());
        let parsed = ArcSeal::parse(&seal.header_string()).unwrap();
        let result = parsed.verify(&sealed, &ed25519_domain_key());
        assert_eq!(result.status(), VerifyStatus::Fail);
    }
}
