//! DMARC (RFC 7489) policy records: parsing `_dmarc.<domain>` TXT and the
//! organizational-domain fallback walk. Alignment evaluation is out of
//! scope; callers combine the record with their own DKIM/SPF outcomes.

use thiserror::Error;
use tracing::debug;

use crate::common::dns::{DnsError, DnsResolver};
use crate::common::domain::organizational_domain;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmarcError {
    #[error("no record found")]
    NoRecord,
    #[error("dns lookup failed: {0}")]
    LookupFailed(String),
    #[error("missing version tag in DMARC record")]
    MissingVersion,
    #[error("invalid version: {0}")]
    InvalidVersion(String),
    #[error("invalid {tag} value: {value}")]
    InvalidTag { tag: &'static str, value: String },
}

fn invalid(tag: &'static str, value: &str) -> DmarcError {
    DmarcError::InvalidTag {
        tag,
        value: value.to_string(),
    }
}

/// `adkim=` / `aspf=` alignment mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentMode {
    #[default]
    Relaxed,
    Strict,
}

/// `p=` / `sp=` policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    None,
    Quarantine,
    Reject,
}

impl Policy {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Policy::None),
            "quarantine" => Some(Policy::Quarantine),
            "reject" => Some(Policy::Reject),
            _ => None,
        }
    }
}

/// `fo=` failure reporting options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOption {
    /// `0`: report when every mechanism fails to produce an aligned pass.
    AllFail,
    /// `1`: report when any mechanism fails to produce an aligned pass.
    AnyFail,
    /// `d`: report on DKIM failure.
    DkimOnly,
    /// `s`: report on SPF failure.
    SpfOnly,
}

/// Parsed `_dmarc.<domain>` record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DmarcRecord {
    /// `v=`, always `DMARC1`.
    pub version: String,
    /// `p=` policy; required on published records.
    pub policy: Option<Policy>,
    /// `sp=` subdomain policy.
    pub subdomain_policy: Option<Policy>,
    pub alignment_dkim: AlignmentMode,
    pub alignment_spf: AlignmentMode,
    /// `pct=`, 0–100; 100 when absent.
    pub percent: Option<u8>,
    /// `ri=` aggregate report interval, seconds.
    pub report_interval: Option<u32>,
    /// `rua=` aggregate report URIs.
    pub aggregate_report_uris: Vec<String>,
    /// `ruf=` forensic report URIs.
    pub forensic_report_uris: Vec<String>,
    pub failure_options: Vec<FailureOption>,
    /// Set when the record was inherited from the organizational domain.
    pub from_org_fallback: bool,
    raw: String,
}

impl DmarcRecord {
    /// Parse a DMARC TXT record with standard tag-list semantics. `v=` must
    /// be `DMARC1`; recognized tags are validated, unknown tags ignored.
    pub fn parse(record: &str) -> Result<Self, DmarcError> {
        let mut rec = DmarcRecord {
            raw: record.to_string(),
            ..Default::default()
        };

        for pair in record.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (k, v) = match pair.split_once('=') {
                Some((k, v)) => (k.trim(), v.trim()),
                None => continue,
            };
            match k {
                "v" => {
                    if v != "DMARC1" {
                        return Err(DmarcError::InvalidVersion(v.to_string()));
                    }
                    rec.version = v.to_string();
                }
                "p" => {
                    rec.policy = Some(Policy::parse(v).ok_or_else(|| invalid("p", v))?);
                }
                "sp" => {
                    rec.subdomain_policy =
                        Some(Policy::parse(v).ok_or_else(|| invalid("sp", v))?);
                }
                "adkim" => {
                    rec.alignment_dkim = match v {
                        "r" => AlignmentMode::Relaxed,
                        "s" => AlignmentMode::Strict,
                        _ => return Err(invalid("adkim", v)),
                    };
                }
                "aspf" => {
                    rec.alignment_spf = match v {
                        "r" => AlignmentMode::Relaxed,
                        "s" => AlignmentMode::Strict,
                        _ => return Err(invalid("aspf", v)),
                    };
                }
                "pct" => {
                    let pct: i64 = v.parse().map_err(|_| invalid("pct", v))?;
                    if !(0..=100).contains(&pct) {
                        return Err(invalid("pct", v));
                    }
                    rec.percent = Some(pct as u8);
                }
                "ri" => {
                    let ri: i64 = v.parse().map_err(|_| invalid("ri", v))?;
                    if ri < 0 || ri > u32::MAX as i64 {
                        return Err(invalid("ri", v));
                    }
                    rec.report_interval = Some(ri as u32);
                }
                "rua" => {
                    rec.aggregate_report_uris =
                        v.split(',').map(|uri| uri.trim().to_string()).collect();
                }
                "ruf" => {
                    rec.forensic_report_uris =
                        v.split(',').map(|uri| uri.trim().to_string()).collect();
                }
                "fo" => {
                    for option in v.split(':') {
                        let parsed = match option.trim() {
                            "0" => FailureOption::AllFail,
                            "1" => FailureOption::AnyFail,
                            "d" => FailureOption::DkimOnly,
                            "s" => FailureOption::SpfOnly,
                            other => return Err(invalid("fo", other)),
                        };
                        rec.failure_options.push(parsed);
                    }
                }
                _ => {}
            }
        }

        if rec.version.is_empty() {
            return Err(DmarcError::MissingVersion);
        }
        Ok(rec)
    }

    /// The TXT record this was parsed from.
    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Fetch and parse `_dmarc.<domain>`.
pub async fn lookup_dmarc_record<R: DnsResolver>(
    resolver: &R,
    domain: &str,
) -> Result<DmarcRecord, DmarcError> {
    let query = format!("_dmarc.{domain}");
    let records = match resolver.query_txt(&query).await {
        Ok(records) => records,
        Err(DnsError::NotFound) => return Err(DmarcError::NoRecord),
        Err(e) => return Err(DmarcError::LookupFailed(e.to_string())),
    };

    for record in &records {
        let parsed = DmarcRecord::parse(record)?;
        if parsed.policy.is_some() {
            debug!(name = %query, "found DMARC record");
            return Ok(parsed);
        }
    }
    Err(DmarcError::NoRecord)
}

/// Walk one label at a time toward the organizational domain.
fn parent_domain(domain: &str) -> Option<String> {
    if organizational_domain(domain) == domain {
        return None;
    }
    domain.split_once('.').map(|(_, parent)| parent.to_string())
}

/// `_dmarc.<domain>` with organizational-domain fallback: when the exact
/// record is absent, parent domains are consulted up to the public-suffix
/// boundary, and a parent record applies only if it defines `sp=`.
pub async fn lookup_dmarc_with_org_fallback<R: DnsResolver>(
    resolver: &R,
    domain: &str,
) -> Result<DmarcRecord, DmarcError> {
    match lookup_dmarc_record(resolver, domain).await {
        Ok(record) => return Ok(record),
        Err(DmarcError::NoRecord) => {}
        Err(e) => return Err(e),
    }

    let mut domain = domain.to_string();
    loop {
        let Some(parent) = parent_domain(&domain) else {
            return Err(DmarcError::NoRecord);
        };
        match lookup_dmarc_record(resolver, &parent).await {
            Ok(mut record) => {
                if record.subdomain_policy.is_none() {
                    return Err(DmarcError::NoRecord);
                }
                record.from_org_fallback = true;
                return Ok(record);
            }
            Err(DmarcError::NoRecord) => domain = parent,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;

    fn txt(resolver: &MockResolver, name: &str, value: &str) {
        resolver.add_txt(name, vec![value.to_string()]);
    }

    // --- parsing ---

    #[test]
    fn parse_minimal() {
        let rec = DmarcRecord::parse("v=DMARC1; p=none").unwrap();
        assert_eq!(rec.version, "DMARC1");
        assert_eq!(rec.policy, Some(Policy::None));
        assert_eq!(rec.alignment_dkim, AlignmentMode::Relaxed);
    }

    #[test]
    fn parse_full() {
        let rec = DmarcRecord::parse(
            "v=DMARC1; p=quarantine; sp=reject; adkim=s; aspf=r; pct=42; ri=86400; \
             rua=mailto:agg@example.com,mailto:agg2@example.com; \
             ruf=mailto:for@example.com; fo=0:1:d:s",
        )
        .unwrap();
        assert_eq!(rec.policy, Some(Policy::Quarantine));
        assert_eq!(rec.subdomain_policy, Some(Policy::Reject));
        assert_eq!(rec.alignment_dkim, AlignmentMode::Strict);
        assert_eq!(rec.alignment_spf, AlignmentMode::Relaxed);
        assert_eq!(rec.percent, Some(42));
        assert_eq!(rec.report_interval, Some(86400));
        assert_eq!(
            rec.aggregate_report_uris,
            vec!["mailto:agg@example.com", "mailto:agg2@example.com"]
        );
        assert_eq!(rec.forensic_report_uris, vec!["mailto:for@example.com"]);
        assert_eq!(rec.failure_options.len(), 4);
    }

    #[test]
    fn parse_missing_version() {
        assert_eq!(
            DmarcRecord::parse("p=none"),
            Err(DmarcError::MissingVersion)
        );
    }

    #[test]
    fn parse_wrong_version() {
        assert!(matches!(
            DmarcRecord::parse("v=DMARC2; p=none"),
            Err(DmarcError::InvalidVersion(_))
        ));
    }

    #[test]
    fn parse_invalid_policy() {
        assert!(DmarcRecord::parse("v=DMARC1; p=maybe").is_err());
        assert!(DmarcRecord::parse("v=DMARC1; p=none; sp=whatever").is_err());
    }

    #[test]
    fn parse_pct_bounds() {
        assert!(DmarcRecord::parse("v=DMARC1; p=none; pct=0").is_ok());
        assert!(DmarcRecord::parse("v=DMARC1; p=none; pct=100").is_ok());
        assert!(DmarcRecord::parse("v=DMARC1; p=none; pct=101").is_err());
        assert!(DmarcRecord::parse("v=DMARC1; p=none; pct=-1").is_err());
    }

    #[test]
    fn parse_ri_must_be_non_negative() {
        assert!(DmarcRecord::parse("v=DMARC1; p=none; ri=0").is_ok());
        assert!(DmarcRecord::parse("v=DMARC1; p=none; ri=-5").is_err());
    }

    #[test]
    fn parse_invalid_fo() {
        assert!(DmarcRecord::parse("v=DMARC1; p=none; fo=z").is_err());
    }

    #[test]
    fn parse_unknown_tags_ignored() {
        assert!(DmarcRecord::parse("v=DMARC1; p=none; zz=top").is_ok());
    }

    // --- lookup ---

    #[tokio::test]
    async fn lookup_direct_record() {
        let resolver = MockResolver::new();
        txt(&resolver, "_dmarc.example.com", "v=DMARC1; p=reject");
        let rec = lookup_dmarc_record(&resolver, "example.com").await.unwrap();
        assert_eq!(rec.policy, Some(Policy::Reject));
        assert!(!rec.from_org_fallback);
    }

    #[tokio::test]
    async fn lookup_missing_is_no_record() {
        let resolver = MockResolver::new();
        assert_eq!(
            lookup_dmarc_record(&resolver, "example.com").await,
            Err(DmarcError::NoRecord)
        );
    }

    #[tokio::test]
    async fn fallback_inherits_with_sp() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "_dmarc.example.com",
            "v=DMARC1; p=reject; sp=quarantine",
        );
        let rec = lookup_dmarc_with_org_fallback(&resolver, "mail.example.com")
            .await
            .unwrap();
        assert_eq!(rec.policy, Some(Policy::Reject));
        assert_eq!(rec.subdomain_policy, Some(Policy::Quarantine));
        assert!(rec.from_org_fallback);
    }

    #[tokio::test]
    async fn fallback_without_sp_is_no_record() {
        let resolver = MockResolver::new();
        txt(&resolver, "_dmarc.example.com", "v=DMARC1; p=reject");
        assert_eq!(
            lookup_dmarc_with_org_fallback(&resolver, "mail.example.com").await,
            Err(DmarcError::NoRecord)
        );
    }

    #[tokio::test]
    async fn fallback_walks_multiple_labels() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "_dmarc.example.com",
            "v=DMARC1; p=none; sp=none",
        );
        let rec = lookup_dmarc_with_org_fallback(&resolver, "a.b.example.com")
            .await
            .unwrap();
        assert!(rec.from_org_fallback);
    }

    #[tokio::test]
    async fn fallback_stops_at_public_suffix() {
        let resolver = MockResolver::new();
        // A registry-level record must never be inherited past the boundary.
        txt(&resolver, "_dmarc.com", "v=DMARC1; p=reject; sp=reject");
        assert_eq!(
            lookup_dmarc_with_org_fallback(&resolver, "example.com").await,
            Err(DmarcError::NoRecord)
        );
    }

    #[tokio::test]
    async fn direct_record_wins_over_fallback() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "_dmarc.mail.example.com",
            "v=DMARC1; p=quarantine",
        );
        txt(
            &resolver,
            "_dmarc.example.com",
            "v=DMARC1; p=reject; sp=reject",
        );
        let rec = lookup_dmarc_with_org_fallback(&resolver, "mail.example.com")
            .await
            .unwrap();
        assert_eq!(rec.policy, Some(Policy::Quarantine));
        assert!(!rec.from_org_fallback);
    }
}
