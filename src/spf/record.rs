use crate::common::cidr::{parse_cidr_default, split_host_and_dual_cidr};
use crate::common::domain::is_valid_domain_spec;

use super::macros::parse_macro_string;
use super::SpfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    All,
    Include,
    A,
    Mx,
    Ip4,
    Ip6,
    /// Deprecated by RFC 7208 but still accepted.
    Ptr,
    Exists,
}

impl std::fmt::Display for Mechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mechanism::All => "all",
            Mechanism::Include => "include",
            Mechanism::A => "a",
            Mechanism::Mx => "mx",
            Mechanism::Ip4 => "ip4",
            Mechanism::Ip6 => "ip6",
            Mechanism::Ptr => "ptr",
            Mechanism::Exists => "exists",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modifier {
    Redirect,
    Exp,
}

/// Qualifier prefix on a mechanism; `+` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Qualifier {
    #[default]
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MechanismEntry {
    pub mechanism: Mechanism,
    /// The raw value after `:` or `/`; dual-CIDR parsing happens at
    /// evaluation time.
    pub value: String,
    pub qualifier: Qualifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifierEntry {
    pub modifier: Modifier,
    pub value: String,
}

/// A parsed `v=spf1` record. The record is immutable after parsing; all
/// macro expansion is deferred to evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpfRecord {
    pub raw: String,
    pub version: String,
    pub mechanisms: Vec<MechanismEntry>,
    pub modifiers: Vec<ModifierEntry>,
    /// Raw, unexpanded `exp=` value.
    pub exp: String,
    /// Whether an `all` mechanism appears; its presence disables `redirect`.
    pub all_exists: bool,
}

impl SpfRecord {
    pub fn modifier(&self, modifier: Modifier) -> Option<&str> {
        self.modifiers
            .iter()
            .find(|m| m.modifier == modifier)
            .map(|m| m.value.as_str())
    }

    /// Tokenize an SPF record string. Errors carry the terminal status:
    /// most syntax problems are `permerror`, while a missing delimiter after
    /// the `v=spf1` sentinel means the TXT record is not an SPF record at
    /// all (`none`).
    pub fn parse(record: &str) -> Result<Self, SpfError> {
        let mut rec = SpfRecord {
            raw: record.to_string(),
            ..Default::default()
        };

        let record = record.trim_end_matches([' ', '\t']);

        // TXT fragments joined without a space: "v=spf1ip4:..." is not a
        // valid SPF record, but it is not a syntax error either.
        if let Some(rest) = record.strip_prefix("v=spf1") {
            if let Some(next) = rest.bytes().next() {
                if next != b' ' && next != b'\t' {
                    return Err(SpfError::none("invalid SPF record: no space after version"));
                }
            }
        }

        if record.contains('\n') || record.contains('\r') {
            return Err(SpfError::permerror("SPF record contains newline characters"));
        }
        for b in record.bytes() {
            if (b < 32 || b > 126) && b != b'\t' {
                return Err(SpfError::permerror("SPF record contains invalid characters"));
            }
        }

        let parts: Vec<&str> = record.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SpfError::permerror("invalid SPF record: empty"));
        }

        // The version sentinel is case-insensitive and must appear exactly
        // once, as the first term.
        let sentinel_count = parts
            .iter()
            .filter(|p| p.eq_ignore_ascii_case("v=spf1"))
            .count();
        if sentinel_count == 0 {
            return Err(SpfError::permerror(
                "invalid SPF record: missing or wrong version",
            ));
        }
        if sentinel_count > 1 {
            return Err(SpfError::permerror(
                "invalid SPF record: multiple v=spf1 directives",
            ));
        }
        if !parts[0].eq_ignore_ascii_case("v=spf1") {
            return Err(SpfError::permerror(
                "invalid SPF record: missing or wrong version",
            ));
        }
        rec.version = "spf1".to_string();

        let mut seen_redirect = false;
        let mut seen_exp = false;

        let mut i = 1;
        while i < parts.len() {
            let raw_term = parts[i];
            let (qualifier, rest) = parse_qualifier(raw_term);

            // A '=' marks a modifier; ':' and '/' mark a mechanism value.
            if let Some(eq) = rest.find('=') {
                let name = &rest[..eq];
                if !is_valid_modifier_name(name) {
                    return Err(SpfError::permerror("invalid modifier name"));
                }
                let name = name.to_ascii_lowercase();
                let value = &rest[eq + 1..];

                match name.as_str() {
                    "redirect" | "exp" => {
                        let modifier = if name == "redirect" {
                            if seen_redirect {
                                return Err(SpfError::permerror(
                                    "redirect modifier appears more than once",
                                ));
                            }
                            seen_redirect = true;
                            Modifier::Redirect
                        } else {
                            if seen_exp {
                                return Err(SpfError::permerror(
                                    "exp modifier appears more than once",
                                ));
                            }
                            seen_exp = true;
                            Modifier::Exp
                        };
                        if value.is_empty() {
                            return Err(SpfError::permerror(format!(
                                "{name}= modifier requires a non-empty value"
                            )));
                        }
                        if !is_valid_domain_spec(value) {
                            return Err(SpfError::permerror(format!(
                                "{name}= modifier value is not a valid domain-spec"
                            )));
                        }
                        if modifier == Modifier::Exp {
                            rec.exp = value.to_string();
                        }
                        rec.modifiers.push(ModifierEntry {
                            modifier,
                            value: value.to_string(),
                        });
                    }
                    _ => {
                        // Unknown modifiers are ignored, but broken macro
                        // syntax in their value still poisons the record.
                        if value.contains('%') && parse_macro_string(value).is_err() {
                            return Err(SpfError::permerror(
                                "invalid macro syntax in unknown modifier",
                            ));
                        }
                    }
                }
                i += 1;
                continue;
            }

            let mut mech_name = rest.to_ascii_lowercase();
            let mut value = String::new();
            if let Some(j) = rest.find([':', '/']) {
                mech_name = rest[..j].to_ascii_lowercase();
                if j == rest.len() - 1 {
                    // Delimiter at the end of the term: the value, if any,
                    // is the next whitespace-separated part.
                    if i + 1 < parts.len() {
                        value = parts[i + 1].trim().to_string();
                        i += 1;
                    }
                } else {
                    value = rest[j + 1..].trim().to_string();
                    if rest.as_bytes()[j] == b'/' {
                        value = format!("/{value}");
                    }
                }
            }

            let mechanism = match mech_name.as_str() {
                "all" => {
                    if !value.is_empty() {
                        return Err(SpfError::permerror("all must not have a value"));
                    }
                    rec.all_exists = true;
                    Mechanism::All
                }
                "include" | "exists" => {
                    if value.is_empty() {
                        return Err(SpfError::permerror(format!(
                            "{mech_name} requires a value"
                        )));
                    }
                    if !is_valid_domain_spec(&value) {
                        return Err(SpfError::permerror(format!(
                            "invalid domain-spec for {mech_name}"
                        )));
                    }
                    if mech_name == "include" {
                        Mechanism::Include
                    } else {
                        Mechanism::Exists
                    }
                }
                "ip4" => {
                    if value.is_empty() {
                        return Err(SpfError::permerror("ip4 requires a value"));
                    }
                    parse_cidr_default(&value, true)
                        .map_err(|e| SpfError::permerror(format!("invalid ip4: {e}")))?;
                    Mechanism::Ip4
                }
                "ip6" => {
                    if value.is_empty() {
                        return Err(SpfError::permerror("ip6 requires a value"));
                    }
                    parse_cidr_default(&value, false)
                        .map_err(|e| SpfError::permerror(format!("invalid ip6: {e}")))?;
                    Mechanism::Ip6
                }
                "a" | "mx" => {
                    if value.is_empty() {
                        // A bare "a:" names an explicitly empty target.
                        if raw_term.ends_with(':') {
                            return Err(SpfError::permerror(format!(
                                "empty domain-spec for {mech_name}"
                            )));
                        }
                    } else {
                        let (host, _, _) =
                            split_host_and_dual_cidr(&value).map_err(|e| {
                                SpfError::permerror(format!("invalid CIDR for {mech_name}: {e}"))
                            })?;
                        if !host.is_empty() && !is_valid_domain_spec(&host) {
                            return Err(SpfError::permerror(format!(
                                "invalid domain-spec for {mech_name}"
                            )));
                        }
                    }
                    if mech_name == "a" {
                        Mechanism::A
                    } else {
                        Mechanism::Mx
                    }
                }
                "ptr" => {
                    if value.is_empty() && raw_term.ends_with(':') {
                        return Err(SpfError::permerror(
                            "domain-spec cannot be empty for ptr",
                        ));
                    }
                    if !value.is_empty() && !is_valid_domain_spec(&value) {
                        return Err(SpfError::permerror("invalid domain-spec for ptr"));
                    }
                    Mechanism::Ptr
                }
                _ => {
                    return Err(SpfError::permerror(format!(
                        "unknown mechanism: {mech_name}"
                    )));
                }
            };

            rec.mechanisms.push(MechanismEntry {
                mechanism,
                value,
                qualifier,
            });
            i += 1;
        }

        Ok(rec)
    }
}

fn parse_qualifier(term: &str) -> (Qualifier, &str) {
    match term.as_bytes().first() {
        Some(b'+') => (Qualifier::Pass, &term[1..]),
        Some(b'-') => (Qualifier::Fail, &term[1..]),
        Some(b'~') => (Qualifier::SoftFail, &term[1..]),
        Some(b'?') => (Qualifier::Neutral, &term[1..]),
        _ => (Qualifier::Pass, term),
    }
}

/// Modifier names: `ALPHA *( ALPHA / DIGIT / "-" / "_" / "." )`.
fn is_valid_modifier_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match bytes.first() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes[1..]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Whether a TXT record is a well-formed SPF record: correct first token,
/// printable ASCII, exactly one version sentinel.
pub(crate) fn is_spf_record(record: &str) -> bool {
    let parts: Vec<&str> = record.trim().split_whitespace().collect();
    match parts.first() {
        Some(first) if first.eq_ignore_ascii_case("v=spf1") => {}
        _ => return false,
    }
    for b in record.bytes() {
        if (b < 32 || b > 126) && b != b'\t' {
            return false;
        }
    }
    parts
        .iter()
        .filter(|p| p.eq_ignore_ascii_case("v=spf1"))
        .count()
        == 1
}
