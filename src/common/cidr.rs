use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Check if an IPv4 address falls within a network/prefix.
/// prefix=0 matches all. prefix>32 matches none.
pub fn ip4_in_network(ip: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 32 {
        return false;
    }
    let mask = !0u32 << (32 - prefix);
    (u32::from(ip) & mask) == (u32::from(network) & mask)
}

/// Check if an IPv6 address falls within a network/prefix.
/// prefix=0 matches all. prefix>128 matches none.
pub fn ip6_in_network(ip: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    if prefix > 128 {
        return false;
    }
    let mask = !0u128 << (128 - prefix);
    (u128::from(ip) & mask) == (u128::from(network) & mask)
}

/// View an address as IPv4, unwrapping an IPv4-mapped IPv6 address.
pub fn as_ipv4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(a) => Some(a),
        IpAddr::V6(a) => a.to_ipv4_mapped(),
    }
}

fn has_leading_zero(s: &str) -> bool {
    s.len() > 1 && s.starts_with('0')
}

/// Split an `a`/`mx` value of the form `host[/v4][//v6]` into its parts.
///
/// Prefix lengths come back as `None` when absent. A colon ahead of the last
/// slash means the "CIDR" is part of a macro-bearing host unless the suffix
/// is purely numeric.
pub fn split_host_and_dual_cidr(s: &str) -> Result<(String, Option<u8>, Option<u8>), String> {
    if s.is_empty() {
        return Ok((String::new(), None, None));
    }

    if let Some(first_colon) = s.find(':') {
        match s.rfind('/') {
            Some(last_slash) if first_colon < last_slash => {
                let cidr_candidate = &s[last_slash + 1..];
                if cidr_candidate.parse::<u32>().is_err() {
                    // Not a numeric suffix, so the whole thing is the host.
                    return Ok((s.to_string(), None, None));
                }
            }
            _ => return Ok((s.to_string(), None, None)),
        }
    }

    let mut v6bits = None;
    let mut host_part = s;

    let double: Vec<&str> = s.split("//").collect();
    if double.len() > 2 {
        return Err("invalid dual CIDR format".to_string());
    }
    if double.len() == 2 {
        host_part = double[0];
        let cidr_part = double[1];
        if cidr_part.is_empty() {
            return Err("invalid dual CIDR format: missing IPv6 CIDR".to_string());
        }
        if has_leading_zero(cidr_part) {
            return Err(format!("bad ipv6 bits: {cidr_part:?} (leading zeros not allowed)"));
        }
        let n: u32 = cidr_part
            .parse()
            .map_err(|_| format!("bad ipv6 bits: {cidr_part:?}"))?;
        if n > 128 {
            return Err(format!("bad ipv6 bits: {cidr_part:?}"));
        }
        v6bits = Some(n as u8);
    }

    let Some(last_slash) = host_part.rfind('/') else {
        return Ok((host_part.to_string(), None, v6bits));
    };

    let host = &host_part[..last_slash];
    let v4cidr = &host_part[last_slash + 1..];
    if v4cidr.is_empty() {
        return Err("invalid dual CIDR format: missing IPv4 CIDR".to_string());
    }
    if has_leading_zero(v4cidr) {
        return Err(format!("bad ipv4 bits: {v4cidr:?} (leading zeros not allowed)"));
    }
    let n: u32 = v4cidr
        .parse()
        .map_err(|_| format!("bad ipv4 bits: {v4cidr:?}"))?;
    if n > 32 {
        return Err(format!("bad ipv4 bits: {v4cidr:?}"));
    }

    Ok((host.to_string(), Some(n as u8), v6bits))
}

/// Parse an `ip4:`/`ip6:` mechanism value: `1.2.3.4`, `1.2.3.0/24`, IPv6
/// forms. The mask defaults to /32 or /128 when omitted.
///
/// Textual IPv4-mapped IPv6 (`::ffff:a.b.c.d`) is an IPv6 value only.
pub fn parse_cidr_default(s: &str, want_v4: bool) -> Result<(IpAddr, u8), String> {
    let (addr_part, mask) = match s.split_once('/') {
        Some((addr, mask_str)) => {
            if mask_str.contains('/') {
                return Err("invalid CIDR format".to_string());
            }
            if has_leading_zero(mask_str) {
                return Err(format!(
                    "invalid CIDR mask: {mask_str:?} (leading zeros not allowed)"
                ));
            }
            let n: u32 = mask_str
                .parse()
                .map_err(|_| format!("invalid CIDR mask: {mask_str:?}"))?;
            (addr, Some(n))
        }
        None => (s, None),
    };

    // Dotted-quad inside a colon form is IPv4-mapped IPv6: never an ip4 value.
    let mapped_text = addr_part.contains(':') && addr_part.contains('.');
    if want_v4 && mapped_text {
        return Err("not an IPv4 address".to_string());
    }

    let ip: IpAddr = addr_part
        .parse()
        .map_err(|_| format!("invalid ip {addr_part:?}"))?;

    let is_v4 = matches!(ip, IpAddr::V4(_));
    if want_v4 && !is_v4 {
        return Err("expected IPv4".to_string());
    }
    if !want_v4 && is_v4 {
        return Err("expected IPv6".to_string());
    }

    let full: u32 = if want_v4 { 32 } else { 128 };
    let bits = mask.unwrap_or(full);
    if bits > full {
        return Err(format!("invalid CIDR mask: {bits}"));
    }

    Ok((ip, bits as u8))
}

/// Match a source address against a candidate under separate v4/v6 prefix
/// lengths. `None` bits default to the full length of the family.
///
/// An IPv4-mapped IPv6 candidate matches an IPv4 source; a pure IPv6
/// candidate never does, regardless of `v6bits`.
pub fn dual_cidr_match(src: IpAddr, dst: IpAddr, v4bits: Option<u8>, v6bits: Option<u8>) -> bool {
    if let Some(src4) = as_ipv4(src) {
        let bits = v4bits.unwrap_or(32);
        if bits > 32 {
            return false;
        }
        match as_ipv4(dst) {
            Some(dst4) => ip4_in_network(src4, dst4, bits),
            None => false,
        }
    } else {
        let IpAddr::V6(src6) = src else { return false };
        let bits = v6bits.unwrap_or(128);
        if bits > 128 {
            return false;
        }
        match dst {
            IpAddr::V6(dst6) if dst6.to_ipv4_mapped().is_none() => {
                ip6_in_network(src6, dst6, bits)
            }
            _ => false,
        }
    }
}
