use base64::Engine;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::canonical::canonicalize_header;
use crate::common::dns::DnsResolver;
use crate::common::status::{VerifyResult, VerifyStatus};
use crate::crypto::verify_signature;
use crate::domainkey::{
    lookup_dkim_domain_key, DomainKey, DomainKeyError, ServiceType,
};
use crate::header::{select_headers_dkim, strip_b_value_for_signing};

use super::signature::{unix_now, Signature};

impl Signature {
    /// Verify this signature against the message headers and the already
    /// computed body hash, with the signer's DomainKey in hand.
    ///
    /// Status determination follows RFC 6376: service-type mismatch is a
    /// permanent error, a missing raw header is neutral, expiry is a
    /// failure, and key problems are permanent while crypto mismatches are
    /// failures.
    pub fn verify(
        &self,
        headers: &[String],
        body_hash: &str,
        domain_key: &DomainKey,
    ) -> VerifyResult {
        let test_suffix = if domain_key.is_test_flag() {
            " test mode"
        } else {
            ""
        };
        let result = |status, msg: &str| VerifyResult::new(status, format!("{msg}{test_suffix}"));

        if !domain_key.is_service(ServiceType::Email) {
            return result(VerifyStatus::PermError, "service type is invalid");
        }

        if self.raw_header.is_empty() {
            return result(VerifyStatus::Neutral, "signature is not found");
        }

        if self.version != 1 {
            return result(VerifyStatus::PermError, "version is invalid");
        }

        if let Some(expiration) = self.expiration {
            if unix_now() > expiration {
                return result(VerifyStatus::Fail, "signature is expired");
            }
            if let Some(timestamp) = self.timestamp {
                if timestamp > expiration {
                    return result(
                        VerifyStatus::PermError,
                        "signature timestamp is greater than expiration",
                    );
                }
            }
        }

        let bh_matches: bool = self
            .body_hash
            .as_bytes()
            .ct_eq(body_hash.as_bytes())
            .into();
        if !bh_matches {
            return result(VerifyStatus::Fail, "body hash is not match");
        }

        let Some(algorithm) = self.algorithm else {
            return result(VerifyStatus::PermError, "algorithm is invalid");
        };
        let Ok((canon_header, _)) = self.canonicalization_pair() else {
            return result(VerifyStatus::PermError, "canonicalization is invalid");
        };

        // Reconstruct the signing input: selected headers bottom-up, then
        // the signature header with b= blanked and no trailing CRLF.
        let names: Vec<String> = self.headers.split(':').map(|s| s.to_string()).collect();
        let selected = select_headers_dkim(headers, &names);

        let mut input = String::new();
        for header in &selected {
            input.push_str(&canonicalize_header(header, canon_header));
        }
        input.push_str(&canonicalize_header(
            &strip_b_value_for_signing(&self.raw_header),
            canon_header,
        ));
        if let Some(stripped) = input.strip_suffix("\r\n") {
            input.truncate(stripped.len());
        }

        let Ok(signature) = base64::engine::general_purpose::STANDARD.decode(&self.signature)
        else {
            return result(VerifyStatus::Fail, "invalid signature");
        };

        let public_key = match domain_key.decode_public_key() {
            Ok(key) => key,
            Err(e) => {
                debug!(domain = %self.domain, selector = %self.selector, error = %e,
                       "public key decode failed");
                return result(VerifyStatus::PermError, "invalid public key");
            }
        };

        if verify_signature(algorithm, &public_key, input.as_bytes(), &signature).is_err() {
            return result(VerifyStatus::Fail, "invalid signature");
        }

        result(VerifyStatus::Pass, "good signature")
    }

    /// Verify after retrieving the DomainKey for `d=`/`s=` over DNS.
    pub async fn verify_with_resolver<R: DnsResolver>(
        &self,
        headers: &[String],
        body_hash: &str,
        resolver: &R,
    ) -> VerifyResult {
        match lookup_dkim_domain_key(resolver, &self.selector, &self.domain).await {
            Ok(domain_key) => self.verify(headers, body_hash, &domain_key),
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
    use crate::common::dns::MockResolver;
    use crate::crypto::{SignatureAlgorithm, SigningKey};

    // SPKI form of the public half of the signing test key, as published in
    // a DomainKey p= tag.
    const TEST_RSA_PUBLIC_KEY_B64: &str = concat!(
        "MIIBIjANBgkqhkiG9w0BAQEFAAOCAQ8AMIIBCgKCAQEAoFEz19zjN1fwLplozRIF",
        "z+f7PdaAQOG5a1kO496NTqLNvvkbDDAIJG3jAAFA/pPkXA5wRzImDuUvMmnurv4I",
        "FZJfvlTEHadBbgpQjgCgSnqUXIYa1U4ELeBfEHFVBV0lUITbZ9kBGjJ92I3qIFr3",
        "PQkysS6/YfJlpBJ0CrC3PlUGfqjtnEQ1pJc9+oZNmIiyw2CrMOdZqiijbN8Zuc2j",
        "qPBl3oW9CJaacv+NZUuoBuOROsmH6/mVAAYFa2RXioOKt214hPH0oFsEzj9CLDqw",
        "qdbVaBpMU4h9OpG1PtP5DIkbNL8vTKfjDHKobvDTY351JZctUTWp3VwovAWadCjn",
        "JQIDAQAB",
    );

    use super::super::signature::tests::{
        test_message_headers, TEST_BODY_HASH, TEST_RSA_PRIVATE_KEY, TEST_SIGNATURE_B64,
    };

    fn test_domain_key() -> DomainKey {
        DomainKey::parse(&format!("v=DKIM1; k=rsa; p={TEST_RSA_PUBLIC_KEY_B64}")).unwrap()
    }

    fn fixture_line() -> String {
        format!(
            "DKIM-Signature: a=rsa-sha256; bh={TEST_BODY_HASH}; c=relaxed/relaxed; \
             d=example.com; h=Date:From:To:Subject:Message-Id; s=selector; t=1706971004; \
             v=1; b={TEST_SIGNATURE_B64}"
        )
    }

    #[test]
    fn verify_known_answer_passes() {
        let sig = Signature::parse(&fixture_line()).unwrap();
        let result = sig.verify(&test_message_headers(), TEST_BODY_HASH, &test_domain_key());
        assert_eq!(result.status(), VerifyStatus::Pass, "{}", result.message());
    }

    #[test]
    fn verify_body_hash_mismatch_fails() {
        let sig = Signature::parse(&fixture_line()).unwrap();
        let result = sig.verify(&test_message_headers(), "invalidbodyhash", &test_domain_key());
        assert_eq!(result.status(), VerifyStatus::Fail);
        assert_eq!(result.message(), "body hash is not match");
    }

    #[test]
    fn verify_tampered_header_fails() {
        let sig = Signature::parse(&fixture_line()).unwrap();
        let mut headers = test_message_headers();
        headers[3] = "Subject: test [overwrite]\r\n".to_string();
        let result = sig.verify(&headers, TEST_BODY_HASH, &test_domain_key());
        assert_eq!(result.status(), VerifyStatus::Fail);
    }

    #[test]
    fn verify_email_service_type_allowed() {
        let key = DomainKey::parse(&format!(
            "v=DKIM1; k=rsa; s=email; p={TEST_RSA_PUBLIC_KEY_B64}"
        ))
        .unwrap();
        let sig = Signature::parse(&fixture_line()).unwrap();
        assert_eq!(
            sig.verify(&test_message_headers(), TEST_BODY_HASH, &key)
                .status(),
            VerifyStatus::Pass
        );
    }

    #[test]
    fn verify_expired_signature_fails() {
        let line = format!(
            "DKIM-Signature: a=rsa-sha256; bh={TEST_BODY_HASH}; c=relaxed/relaxed; \
             d=example.com; h=From; s=selector; t=1000; x=2000; v=1; b={TEST_SIGNATURE_B64}"
        );
        let sig = Signature::parse(&line).unwrap();
        let result = sig.verify(&test_message_headers(), TEST_BODY_HASH, &test_domain_key());
        assert_eq!(result.status(), VerifyStatus::Fail);
        assert_eq!(result.message(), "signature is expired");
    }

    #[test]
    fn verify_test_flag_annotates_message() {
        let key = DomainKey::parse(&format!(
            "v=DKIM1; k=rsa; t=y; p={TEST_RSA_PUBLIC_KEY_B64}"
        ))
        .unwrap();
        let sig = Signature::parse(&fixture_line()).unwrap();
        let result = sig.verify(&test_message_headers(), TEST_BODY_HASH, &key);
        assert_eq!(result.status(), VerifyStatus::Pass);
        assert!(result.message().ends_with(" test mode"));
    }

    #[test]
    fn verify_garbage_public_key_is_permerror() {
        let key = DomainKey::parse("v=DKIM1; k=rsa; p=Z2FyYmFnZQ==").unwrap();
        let sig = Signature::parse(&fixture_line()).unwrap();
        let result = sig.verify(&test_message_headers(), TEST_BODY_HASH, &key);
        assert_eq!(result.status(), VerifyStatus::PermError);
        assert_eq!(result.message(), "invalid public key");
    }

    #[tokio::test]
    async fn verify_with_resolver_passes() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "selector._domainkey.example.com",
            vec![format!("v=DKIM1; k=rsa; p={TEST_RSA_PUBLIC_KEY_B64}")],
        );
        let sig = Signature::parse(&fixture_line()).unwrap();
        let result = sig
            .verify_with_resolver(&test_message_headers(), TEST_BODY_HASH, &resolver)
            .await;
        assert_eq!(result.status(), VerifyStatus::Pass, "{}", result.message());
    }

    #[tokio::test]
    async fn verify_with_resolver_missing_key_is_permerror() {
        let resolver = MockResolver::new();
        let sig = Signature::parse(&fixture_line()).unwrap();
        let result = sig
            .verify_with_resolver(&test_message_headers(), TEST_BODY_HASH, &resolver)
            .await;
        assert_eq!(result.status(), VerifyStatus::PermError);
        assert_eq!(result.message(), "domain key is not found");
    }

    #[test]
    fn sign_then_verify_roundtrip_simple() {
        let key = SigningKey::from_pkcs8_pem(TEST_RSA_PRIVATE_KEY).unwrap();
        let mut sig = Signature {
            version: 1,
            algorithm: Some(SignatureAlgorithm::RsaSha256),
            body_hash: TEST_BODY_HASH.to_string(),
            canonicalization: "simple/simple".to_string(),
            domain: "example.com".to_string(),
            selector: "selector".to_string(),
            timestamp: Some(1706971004),
            ..Default::default()
        };
        sig.sign(&test_message_headers(), &key).unwrap();

        // Re-parse the emitted header as a verifier would see it.
        let emitted = sig.header_string();
        let parsed = Signature::parse(emitted.trim_end_matches("\r\n")).unwrap();
        let result = parsed.verify(&test_message_headers(), TEST_BODY_HASH, &test_domain_key());
        assert_eq!(result.status(), VerifyStatus::Pass, "{}", result.message());
    }
}
