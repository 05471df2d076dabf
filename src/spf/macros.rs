use std::net::IpAddr;

/// Where an expansion happens: domain-spec targets (`include`, `redirect`,
/// `a`, `mx`, `exists`, `ptr`) or the `exp=` explanation string. The `c`,
/// `r` and `t` macros are only legal in explanations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroPurpose {
    DomainSpec,
    Exp,
}

/// Inputs of a macro expansion.
#[derive(Debug, Clone)]
pub struct MacroContext<'a> {
    pub ip: IpAddr,
    /// The `check_host` current domain.
    pub domain: &'a str,
    /// MAIL FROM, already rewritten to `postmaster@<domain>` when empty.
    pub sender: &'a str,
    pub helo: &'a str,
    pub receiver: &'a str,
    /// Unix seconds for `%{t}`.
    pub now: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacroToken {
    Literal(String),
    Macro(MacroExpr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacroExpr {
    /// Macro letter; uppercase requests URL-escaping of the result.
    pub letter: char,
    /// Keep the right-most N labels; must be positive when present.
    pub digits: Option<usize>,
    /// Reverse the labels.
    pub reverse: bool,
    /// Delimiter set to split on; `.` when empty.
    pub delimiters: String,
}

fn is_macro_letter(c: char) -> bool {
    matches!(
        c.to_ascii_lowercase(),
        's' | 'l' | 'o' | 'd' | 'i' | 'p' | 'v' | 'h' | 'c' | 'r' | 't'
    )
}

fn is_macro_delimiter(c: char) -> bool {
    matches!(c, '.' | '-' | '_' | '/' | '=' | '+' | ',')
}

/// Parse a macro-string: literals, `%%`, `%_`, `%-` and
/// `%{letter[digits][r][delimiters]}`. A zero digit count is rejected.
pub fn parse_macro_string(s: &str) -> Result<Vec<MacroToken>, String> {
    let chars: Vec<char> = s.chars().collect();
    let n = chars.len();
    let mut out = Vec::new();

    let mut i = 0;
    while i < n {
        if chars[i] != '%' {
            let start = i;
            while i < n && chars[i] != '%' {
                i += 1;
            }
            out.push(MacroToken::Literal(chars[start..i].iter().collect()));
            continue;
        }

        if i + 1 >= n {
            return Err("dangling % at end".to_string());
        }
        match chars[i + 1] {
            '%' => {
                out.push(MacroToken::Literal("%".to_string()));
                i += 2;
            }
            '_' => {
                out.push(MacroToken::Literal(" ".to_string()));
                i += 2;
            }
            '-' => {
                out.push(MacroToken::Literal("%20".to_string()));
                i += 2;
            }
            '{' => {
                let mut j = i + 2;
                if j >= n {
                    return Err("incomplete macro after %{".to_string());
                }
                if !is_macro_letter(chars[j]) {
                    return Err(format!("invalid macro letter {:?}", chars[j]));
                }
                let mut expr = MacroExpr {
                    letter: chars[j],
                    digits: None,
                    reverse: false,
                    delimiters: String::new(),
                };
                j += 1;

                let num_start = j;
                while j < n && chars[j].is_ascii_digit() {
                    j += 1;
                }
                if j > num_start {
                    let num: usize = chars[num_start..j]
                        .iter()
                        .collect::<String>()
                        .parse()
                        .map_err(|_| "invalid digit transformer".to_string())?;
                    if num == 0 {
                        return Err("DIGIT transformer must be non-zero".to_string());
                    }
                    expr.digits = Some(num);
                }

                if j < n && chars[j] == 'r' {
                    expr.reverse = true;
                    j += 1;
                }

                let delim_start = j;
                while j < n && chars[j] != '}' {
                    if !is_macro_delimiter(chars[j]) {
                        return Err(format!("invalid delimiter {:?} in macro", chars[j]));
                    }
                    j += 1;
                }
                if j >= n {
                    return Err("macro not closed with }".to_string());
                }
                if j > delim_start {
                    expr.delimiters = chars[delim_start..j].iter().collect();
                }

                out.push(MacroToken::Macro(expr));
                i = j + 1;
            }
            c => Err(format!("unsupported escape '%{c}' (use %{{...}})"))?,
        }
    }
    Ok(out)
}

/// `%{i}`: the dotted-quad for IPv4, the 32-nibble dot form with uppercase
/// hex for IPv6.
pub(crate) fn macro_client_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let mut nibbles = Vec::with_capacity(32);
            for byte in v6.octets() {
                nibbles.push(format!("{:X}", byte >> 4));
                nibbles.push(format!("{:X}", byte & 0x0f));
            }
            nibbles.join(".")
        }
    }
}

/// RFC 3986 unreserved characters survive; everything else becomes `%XX`.
fn url_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Expand parsed tokens. `ptr_name` is the validated PTR name for `%{p}`
/// (the evaluator resolves it; `"unknown"` when validation found nothing).
pub fn expand_tokens(
    tokens: &[MacroToken],
    ctx: &MacroContext<'_>,
    ptr_name: &str,
    purpose: MacroPurpose,
) -> Result<String, String> {
    let mut out = String::new();
    for token in tokens {
        match token {
            MacroToken::Literal(lit) => out.push_str(lit),
            MacroToken::Macro(expr) => out.push_str(&expand_macro(expr, ctx, ptr_name, purpose)?),
        }
    }
    Ok(out)
}

fn expand_macro(
    expr: &MacroExpr,
    ctx: &MacroContext<'_>,
    ptr_name: &str,
    purpose: MacroPurpose,
) -> Result<String, String> {
    let lower = expr.letter.to_ascii_lowercase();
    if matches!(lower, 'c' | 'r' | 't') && purpose == MacroPurpose::DomainSpec {
        return Err(format!("macro %{} only allowed in exp=", expr.letter));
    }

    let is_v4 = crate::common::cidr::as_ipv4(ctx.ip).is_some();
    let raw = match lower {
        's' => ctx.sender.to_string(),
        'l' => match ctx.sender.find('@') {
            Some(at) => ctx.sender[..at].to_string(),
            None => ctx.sender.to_string(),
        },
        'o' => match ctx.sender.find('@') {
            Some(at) => ctx.sender[at + 1..].to_string(),
            None => ctx.domain.to_string(),
        },
        'd' => ctx.domain.to_string(),
        'i' => macro_client_ip(ctx.ip),
        'p' => ptr_name.to_string(),
        'v' => if is_v4 { "in-addr" } else { "ip6" }.to_string(),
        'h' => ctx.helo.to_string(),
        'c' => ctx.ip.to_string(),
        'r' => ctx.receiver.to_string(),
        't' => ctx.now.to_string(),
        _ => return Err(format!("unknown macro letter: {}", expr.letter)),
    };

    // Split into labels. The 'i' macro splits only under reversal (octets
    // or nibbles are already dot-separated); 'c' keeps the IPv6 text form
    // as a single label.
    let mut labels: Vec<String> = if lower == 'i' {
        if expr.reverse {
            let mut parts: Vec<String> = raw.split('.').map(str::to_string).collect();
            parts.reverse();
            parts
        } else {
            vec![raw]
        }
    } else if lower == 'c' {
        if is_v4 {
            raw.split('.').map(str::to_string).collect()
        } else {
            vec![raw]
        }
    } else if !expr.delimiters.is_empty() && expr.delimiters != "." {
        let mut parts = vec![raw];
        for delim in expr.delimiters.chars() {
            parts = parts
                .iter()
                .flat_map(|p| p.split(delim).map(str::to_string))
                .collect();
        }
        parts
    } else {
        raw.split('.').map(str::to_string).collect()
    };

    if expr.reverse && lower != 'i' {
        labels.reverse();
    }

    if let Some(num) = expr.digits {
        if num < labels.len() {
            labels = labels.split_off(labels.len() - num);
        }
    }

    let joined = labels.join(".");
    if expr.letter.is_ascii_uppercase() {
        Ok(url_escape(&joined))
    } else {
        Ok(joined)
    }
}

/// RFC 7208 §7.3: a domain over 253 octets after expansion loses leading
/// labels until it fits; if a single label is still too long, the rightmost
/// 253 bytes survive.
pub(crate) fn truncate_domain(expanded: String) -> String {
    if expanded.len() <= 253 {
        return expanded;
    }
    let mut labels: Vec<&str> = expanded.split('.').collect();
    while labels.iter().map(|l| l.len() + 1).sum::<usize>() - 1 > 253 {
        if labels.len() <= 1 {
            return expanded[expanded.len() - 253..].to_string();
        }
        labels.remove(0);
    }
    labels.join(".")
}
