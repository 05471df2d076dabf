//! Header-line utilities shared by the DKIM and ARC engines: field and
//! tag-list parsing, RFC 6376 §5.4.2 header selection, `b=` stripping for
//! signing input, signature folding and address extraction.

use std::collections::HashMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeaderError {
    #[error("invalid email address format")]
    InvalidEmailFormat,
    #[error("malformed header params")]
    MalformedHeaderParams,
}

/// Split a header line on the first colon, trimming both sides.
pub fn parse_header_field(line: &str) -> (String, String) {
    match line.split_once(':') {
        Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
        None => (line.trim().to_string(), String::new()),
    }
}

/// Parse a `tag=value; tag=value` list into ordered pairs with lower-cased
/// tag names. Empty entries are skipped; an entry without `=` is malformed.
pub fn parse_header_params(value: &str) -> Result<Vec<(String, String)>, HeaderError> {
    let mut params = Vec::new();
    for part in value.split(';') {
        if part.trim().is_empty() {
            continue;
        }
        let Some((name, val)) = part.split_once('=') else {
            return Err(HeaderError::MalformedHeaderParams);
        };
        params.push((
            name.trim().to_ascii_lowercase(),
            val.trim().to_string(),
        ));
    }
    Ok(params)
}

/// Remove every whitespace character (FWS included) from a tag value.
pub fn strip_whitespace(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Fold a base64 signature for emission: 64-char chunks joined by CRLF and
/// nine spaces.
pub fn wrap_signature(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut chunks = Vec::new();
    let mut rest = bytes;
    while rest.len() > 64 {
        let (head, tail) = rest.split_at(64);
        chunks.push(std::str::from_utf8(head).unwrap_or_default());
        rest = tail;
    }
    chunks.push(std::str::from_utf8(rest).unwrap_or_default());
    chunks.join("\r\n         ")
}

fn is_fws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Blank the `b=` tag value of a raw signature header line while preserving
/// every other byte, folding included (RFC 6376 §3.7 pre-hash rewrite).
///
/// The tag must be preceded by the start of the line, `;`, or WSP; the value
/// runs to the next `;` or line terminator, skipping folded continuations.
/// Lines without a `b=` tag come back unchanged.
pub fn strip_b_value_for_signing(raw_line: &str) -> String {
    let bytes = raw_line.as_bytes();

    let mut start = None;
    for i in 0..bytes.len().saturating_sub(1) {
        if (bytes[i] == b'b' || bytes[i] == b'B') && bytes[i + 1] == b'=' {
            if i == 0 || bytes[i - 1] == b';' || is_fws(bytes[i - 1]) {
                start = Some(i + 2);
                break;
            }
        }
    }
    let Some(start) = start else {
        return raw_line.to_string();
    };

    let mut i = start;
    while i < bytes.len() && is_fws(bytes[i]) {
        i += 1;
    }
    while i < bytes.len() {
        if i + 2 < bytes.len() && bytes[i] == b'\r' && bytes[i + 1] == b'\n' && is_fws(bytes[i + 2])
        {
            i += 3;
            continue;
        }
        if bytes[i] == b';' || bytes[i] == b'\r' || bytes[i] == b'\n' {
            break;
        }
        i += 1;
    }

    let mut result = String::with_capacity(raw_line.len() - (i - start));
    result.push_str(&raw_line[..start]);
    result.push_str(&raw_line[i..]);
    result
}

/// Blank the `b=` value in the tag-list form: split on `;`, keep every field
/// byte-for-byte except the one whose trimmed key is `b`.
pub fn delete_signature_value(line: &str) -> String {
    let mut fields = Vec::new();
    for field in line.split(';') {
        match field.split_once('=') {
            Some((key, value)) => {
                if key.trim() == "b" {
                    fields.push(format!("{key}="));
                } else {
                    fields.push(format!("{key}={value}"));
                }
            }
            None => fields.push(field.to_string()),
        }
    }
    fields.join(";")
}

fn header_name(line: &str) -> Option<String> {
    line.split_once(':')
        .map(|(name, _)| name.trim().to_ascii_lowercase())
}

/// Select headers for DKIM signing input per RFC 6376 §5.4.2.
///
/// `names` (the `h=` list) is processed left to right; each name consumes the
/// bottom-most remaining instance of that header. A name with no remaining
/// instance contributes nothing (the "null string" case).
pub fn select_headers_dkim(headers: &[String], names: &[String]) -> Vec<String> {
    let mut by_name: HashMap<String, Vec<&String>> = HashMap::new();
    for header in headers {
        if let Some(name) = header_name(header) {
            by_name.entry(name).or_default().push(header);
        }
    }

    let mut selected = Vec::new();
    for name in names {
        let key = name.trim().to_ascii_lowercase();
        if let Some(instances) = by_name.get_mut(&key) {
            if let Some(last) = instances.pop() {
                selected.push(last.clone());
            }
        }
    }
    selected
}

/// Collect every header whose name matches any of `names`, grouped by name in
/// `names` order, message order within a name. Used to gather ARC sets.
pub fn extract_headers_all(headers: &[String], names: &[String]) -> Vec<String> {
    let mut keys = Vec::new();
    for name in names {
        let key = name.to_ascii_lowercase();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut ret = Vec::new();
    for key in &keys {
        for header in headers {
            if header_name(header).as_deref() == Some(key) {
                ret.push(header.clone());
            }
        }
    }
    ret
}

/// First header matching `name`, or `None`.
pub fn extract_header<'a>(headers: &'a [String], name: &str) -> Option<&'a String> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|h| header_name(h).as_deref() == Some(&key))
}

/// Deduplicate while preserving first-seen order.
pub fn remove_duplicates(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|s| seen.insert(s.clone())).collect()
}

/// Extract the address from a `From:`-style value: the bracketed address
/// when present, else the trimmed input. Quote-aware, so `<>` inside a
/// quoted local-part or display name is not mistaken for brackets.
pub fn parse_address(value: &str) -> String {
    let mut quoted = false;
    let mut start = 0;
    let mut end = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '<' if !quoted => start = i,
            '>' if !quoted => end = i,
            _ => {}
        }
    }

    let address = if start < end {
        &value[start + 1..end]
    } else {
        value
    };
    address.trim().to_string()
}

/// The domain of an address header value: everything after the rightmost `@`.
pub fn parse_address_domain(value: &str) -> Result<String, HeaderError> {
    let addr = parse_address(value);
    if addr.is_empty() {
        return Err(HeaderError::InvalidEmailFormat);
    }
    match addr.rsplit_once('@') {
        Some((_, domain)) if !domain.is_empty() => Ok(domain.to_string()),
        _ => Err(HeaderError::InvalidEmailFormat),
    }
}

/// Canonicalization tokens of a `c=` tag: `header/body`, a single token
/// applying to the header side, or empty meaning `simple/simple`.
pub fn parse_canonicalization_pair(
    s: &str,
) -> Result<(crate::canonical::Canonicalization, crate::canonical::Canonicalization), HeaderError> {
    use crate::canonical::Canonicalization;

    if s.is_empty() {
        return Ok((Canonicalization::Simple, Canonicalization::Simple));
    }
    match s.split_once('/') {
        Some((header, body)) => {
            let h = Canonicalization::parse(header)
                .ok_or(HeaderError::MalformedHeaderParams)?;
            let b = Canonicalization::parse(body)
                .ok_or(HeaderError::MalformedHeaderParams)?;
            Ok((h, b))
        }
        None => {
            let h = Canonicalization::parse(s).ok_or(HeaderError::MalformedHeaderParams)?;
            Ok((h, Canonicalization::Simple))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> String {
        v.to_string()
    }

    // --- parse_header_field / parse_header_params ---

    #[test]
    fn field_splits_on_first_colon() {
        let (k, v) = parse_header_field("Subject: a: b\r\n");
        assert_eq!(k, "Subject");
        assert_eq!(v, "a: b");
    }

    #[test]
    fn params_ordered_and_lowercased() {
        let params = parse_header_params("A=1; b = 2 ;; C=x=y").unwrap();
        assert_eq!(
            params,
            vec![
                (s("a"), s("1")),
                (s("b"), s("2")),
                (s("c"), s("x=y")),
            ]
        );
    }

    #[test]
    fn params_entry_without_equals_is_malformed() {
        assert_eq!(
            parse_header_params("a=1; nonsense"),
            Err(HeaderError::MalformedHeaderParams)
        );
    }

    // --- wrap_signature ---

    #[test]
    fn wrap_signature_short_unchanged() {
        assert_eq!(wrap_signature("abc"), "abc");
    }

    #[test]
    fn wrap_signature_chunks_at_64() {
        let sig = "A".repeat(130);
        let wrapped = wrap_signature(&sig);
        let parts: Vec<&str> = wrapped.split("\r\n         ").collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 64);
        assert_eq!(parts[1].len(), 64);
        assert_eq!(parts[2].len(), 2);
    }

    // --- strip_b_value_for_signing ---

    #[test]
    fn strip_b_basic() {
        let line = "DKIM-Signature: v=1; b=SIGDATA; bh=HASH\r\n";
        assert_eq!(
            strip_b_value_for_signing(line),
            "DKIM-Signature: v=1; b=; bh=HASH\r\n"
        );
    }

    #[test]
    fn strip_b_does_not_touch_bh() {
        let line = "DKIM-Signature: bh=bodyhash; b=signature\r\n";
        let stripped = strip_b_value_for_signing(line);
        assert!(stripped.contains("bh=bodyhash"));
        assert!(!stripped.contains("signature"));
    }

    #[test]
    fn strip_b_at_end_of_line() {
        let line = "DKIM-Signature: a=rsa-sha256; bh=hash; b=signature";
        assert!(strip_b_value_for_signing(line).ends_with("b="));
    }

    #[test]
    fn strip_b_spans_folded_value() {
        let line = "DKIM-Signature: a=rsa-sha256;\r\n b=AAAA\r\n BBBB; bh=hash\r\n";
        assert_eq!(
            strip_b_value_for_signing(line),
            "DKIM-Signature: a=rsa-sha256;\r\n b=; bh=hash\r\n"
        );
    }

    #[test]
    fn strip_b_uppercase_tag() {
        let line = "DKIM-Signature: B=SIG; bh=hash\r\n";
        assert_eq!(
            strip_b_value_for_signing(line),
            "DKIM-Signature: B=; bh=hash\r\n"
        );
    }

    #[test]
    fn strip_b_absent_returns_input() {
        let line = "DKIM-Signature: a=rsa-sha256; bh=hash\r\n";
        assert_eq!(strip_b_value_for_signing(line), line);
    }

    // --- delete_signature_value ---

    #[test]
    fn delete_signature_tag_form() {
        let line = "i=1; a=rsa-sha256; b=SIGDATA; d=example.com";
        assert_eq!(
            delete_signature_value(line),
            "i=1; a=rsa-sha256; b=; d=example.com"
        );
    }

    #[test]
    fn delete_signature_preserves_other_fields() {
        let line = "ARC-Seal: i=1; cv=none; b=abc";
        assert_eq!(delete_signature_value(line), "ARC-Seal: i=1; cv=none; b=");
    }

    // --- select_headers_dkim ---

    #[test]
    fn select_takes_bottom_most() {
        let headers = vec![
            s("Hoge: hoge1\r\n"),
            s("From: a@example.com\r\n"),
            s("Hoge: hoge2\r\n"),
        ];
        let selected =
            select_headers_dkim(&headers, &[s("Date"), s("Subject"), s("Hoge")]);
        assert_eq!(selected, vec![s("Hoge: hoge2\r\n")]);
    }

    #[test]
    fn select_duplicate_names_consume_bottom_up() {
        let headers = vec![s("Hoge: hoge1\r\n"), s("Hoge: hoge2\r\n")];
        let selected = select_headers_dkim(&headers, &[s("Hoge"), s("Hoge")]);
        assert_eq!(selected, vec![s("Hoge: hoge2\r\n"), s("Hoge: hoge1\r\n")]);
    }

    #[test]
    fn select_missing_name_contributes_nothing() {
        let headers = vec![s("From: a@example.com\r\n")];
        let selected = select_headers_dkim(&headers, &[s("From"), s("Subject")]);
        assert_eq!(selected, vec![s("From: a@example.com\r\n")]);
    }

    #[test]
    fn select_is_case_insensitive() {
        let headers = vec![s("FROM: a@example.com\r\n")];
        let selected = select_headers_dkim(&headers, &[s("from")]);
        assert_eq!(selected.len(), 1);
    }

    // --- extract_headers_all ---

    #[test]
    fn extract_all_groups_by_name() {
        let headers = vec![
            s("ARC-Seal: i=1; b=x\r\n"),
            s("ARC-Message-Signature: i=1; b=y\r\n"),
            s("ARC-Seal: i=2; b=z\r\n"),
        ];
        let all = extract_headers_all(
            &headers,
            &[s("ARC-Message-Signature"), s("ARC-Seal")],
        );
        assert_eq!(
            all,
            vec![
                s("ARC-Message-Signature: i=1; b=y\r\n"),
                s("ARC-Seal: i=1; b=x\r\n"),
                s("ARC-Seal: i=2; b=z\r\n"),
            ]
        );
    }

    // --- parse_address / parse_address_domain ---

    #[test]
    fn address_plain() {
        assert_eq!(parse_address("user@example.com"), "user@example.com");
    }

    #[test]
    fn address_bracketed() {
        assert_eq!(
            parse_address("Alice Example <alice@example.com>"),
            "alice@example.com"
        );
    }

    #[test]
    fn address_brackets_inside_quotes_ignored() {
        assert_eq!(
            parse_address("\"weird <not@this>\" <real@example.com>"),
            "real@example.com"
        );
    }

    #[test]
    fn address_quoted_local_part() {
        assert_eq!(
            parse_address("<\"quoted@local\"@example.com>"),
            "\"quoted@local\"@example.com"
        );
    }

    #[test]
    fn address_domain_rightmost_at() {
        assert_eq!(
            parse_address_domain("user@host@example.com").unwrap(),
            "example.com"
        );
    }

    #[test]
    fn address_domain_missing_is_error() {
        assert_eq!(
            parse_address_domain("no-at-sign"),
            Err(HeaderError::InvalidEmailFormat)
        );
        assert_eq!(
            parse_address_domain("user@"),
            Err(HeaderError::InvalidEmailFormat)
        );
        assert_eq!(
            parse_address_domain("   "),
            Err(HeaderError::InvalidEmailFormat)
        );
    }

    // --- parse_canonicalization_pair ---

    #[test]
    fn canon_pair_defaults() {
        use crate::canonical::Canonicalization::*;
        assert_eq!(parse_canonicalization_pair("").unwrap(), (Simple, Simple));
        assert_eq!(
            parse_canonicalization_pair("relaxed").unwrap(),
            (Relaxed, Simple)
        );
        assert_eq!(
            parse_canonicalization_pair("relaxed/relaxed").unwrap(),
            (Relaxed, Relaxed)
        );
    }

    #[test]
    fn canon_pair_rejects_unknown() {
        assert!(parse_canonicalization_pair("nofws").is_err());
        assert!(parse_canonicalization_pair("relaxed/nofws").is_err());
    }
}
