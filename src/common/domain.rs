use std::net::IpAddr;

/// Normalize a domain: lowercase + strip trailing dot.
pub fn normalize(domain: &str) -> String {
    let d = domain.to_ascii_lowercase();
    d.strip_suffix('.').unwrap_or(&d).to_string()
}

/// Determine the organizational domain using the Public Suffix List.
///
/// The organizational domain is the public suffix plus one label:
/// `mail.example.com` → `example.com`, `foo.bar.co.uk` → `bar.co.uk`.
pub fn organizational_domain(domain: &str) -> String {
    let normalized = normalize(domain);
    match psl::domain_str(&normalized) {
        Some(org) => org.to_string(),
        None => normalized,
    }
}

/// Validate a fully qualified domain name per RFC 1035 rules, plus the
/// bracketed IP-literal form (`[192.0.2.1]`).
pub fn is_valid_domain(domain: &str) -> bool {
    if let Some(content) = domain
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        if content.is_empty() || content.len() > 253 {
            return false;
        }
        return content.parse::<IpAddr>().is_ok();
    }

    if domain.is_empty() || domain.len() > 253 {
        return false;
    }

    // A trailing dot (rooted name) is allowed.
    let domain = domain.strip_suffix('.').unwrap_or(domain);
    if domain.is_empty() {
        return false;
    }

    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return false;
    }

    for label in labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        let bytes = label.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return false;
        }
        if !bytes
            .iter()
            .all(|&b| b.is_ascii_alphanumeric() || b == b'-')
        {
            return false;
        }
    }
    true
}

/// Validate an SPF domain-spec before macro expansion.
///
/// Deliberately looser than [`is_valid_domain`]: macro syntax has not been
/// expanded yet, so `%`-headed labels pass through, labels may start with
/// `_`, and `/` is tolerated inside labels for the colon/slash corner cases.
/// Strict FQDN validity is only enforced after expansion.
pub fn is_valid_domain_spec(spec: &str) -> bool {
    if spec.len() > 253 {
        return false;
    }
    if spec.contains("..") || spec.starts_with('.') {
        return false;
    }
    // Printable ASCII only; whitespace and control characters are out.
    if !spec.bytes().all(|b| (0x21..=0x7e).contains(&b)) {
        return false;
    }

    if !spec.contains(':') {
        return is_valid_domain_spec_without_colon(spec);
    }

    // The top-level label must not contain a colon unless it is a macro.
    if let Some(top) = spec.split('.').next_back() {
        if top.contains(':') && !top.starts_with('%') {
            return false;
        }
    }

    // `foo:bar/baz.example.com`: validate the part after the colon.
    if let (Some(first_colon), Some(last_slash)) = (spec.find(':'), spec.rfind('/')) {
        if first_colon < last_slash {
            return is_valid_domain_spec_without_colon(&spec[first_colon + 1..]);
        }
    }

    // Otherwise the part before the first colon must be a domain or a macro.
    let head = spec.split(':').next().unwrap_or_default();
    if !is_valid_domain(head) && !head.starts_with('%') {
        return false;
    }
    true
}

fn is_valid_domain_spec_without_colon(spec: &str) -> bool {
    if !spec.contains('.') {
        // A single label must be a macro to pass; bare labels are not FQDNs.
        return spec.starts_with('%');
    }

    // A literal IP address is not a domain-spec.
    if spec.parse::<IpAddr>().is_ok() {
        return false;
    }

    let mut labels: Vec<&str> = spec.split('.').collect();
    // A rooted name leaves a final empty label; drop it before validation.
    if labels.last() == Some(&"") {
        labels.pop();
    }
    if labels.len() <= 1 {
        return false;
    }

    for label in &labels {
        if label.starts_with('%') {
            continue;
        }
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        let bytes = label.as_bytes();
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if !(first.is_ascii_alphanumeric() || first == b'_') {
            return false;
        }
        if !last.is_ascii_alphanumeric() {
            return false;
        }
        if !bytes.iter().all(|&b| {
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'/' || b == b'%'
        }) {
            return false;
        }
    }

    // A purely numeric top-level label is not allowed, except via macro.
    let top = labels[labels.len() - 1];
    if !top.starts_with('%') && top.parse::<u64>().is_ok() {
        return false;
    }
    true
}
