use std::collections::HashSet;
use std::net::IpAddr;

use tracing::{debug, trace};

use crate::common::cidr::{
    as_ipv4, dual_cidr_match, ip4_in_network, ip6_in_network, parse_cidr_default,
    split_host_and_dual_cidr,
};
use crate::common::dns::{DnsError, DnsResolver, MxRecord};
use crate::common::domain::{is_valid_domain, is_valid_domain_spec};

use super::macros::{
    expand_tokens, parse_macro_string, truncate_domain, MacroContext, MacroPurpose, MacroToken,
};
use super::record::{is_spf_record, Mechanism, MechanismEntry, Modifier, Qualifier, SpfRecord};
use super::{SpfError, SpfResult, SpfStatus};

/// RFC 7208 §4.6.4: at most 10 DNS-consuming terms per evaluation.
const MAX_DNS_TERMS: usize = 10;
/// RFC 7208 §4.6.4: at most 2 void lookups per evaluation.
const MAX_VOID_LOOKUPS: usize = 2;
/// Include/redirect recursion bound.
const MAX_DEPTH: usize = 10;
/// PTR answers processed beyond this are silently dropped.
const MAX_PTR_RECORDS: usize = 10;

/// One `check_host` evaluation: the resolver plus the per-operation budget
/// counters and the visited set for cycle detection. Counters are shared by
/// every nested `include`/`redirect` of the same evaluation; layered
/// resolvers can observe them through the accessors.
pub struct SpfEvaluator<'a, R: DnsResolver> {
    dns: &'a R,
    term_count: usize,
    void_count: usize,
    visited: HashSet<String>,
}

/// Evaluate `check_host(ip, domain, sender)` with a fresh evaluator.
pub async fn check_host<R: DnsResolver>(
    resolver: &R,
    ip: IpAddr,
    domain: &str,
    sender: &str,
    helo: &str,
) -> SpfResult {
    SpfEvaluator::new(resolver).check_host(ip, domain, sender, helo).await
}

impl<'a, R: DnsResolver> SpfEvaluator<'a, R> {
    pub fn new(dns: &'a R) -> Self {
        Self {
            dns,
            term_count: 0,
            void_count: 0,
            visited: HashSet::new(),
        }
    }

    /// DNS-consuming terms spent so far.
    pub fn term_count(&self) -> usize {
        self.term_count
    }

    /// Void lookups observed so far.
    pub fn void_count(&self) -> usize {
        self.void_count
    }

    /// RFC 7208 §4: evaluate the sender policy of `domain` against the
    /// connecting `ip`.
    pub async fn check_host(
        &mut self,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
    ) -> SpfResult {
        self.term_count = 0;
        self.void_count = 0;
        self.visited.clear();

        if !is_valid_domain(domain) {
            return SpfResult::new(SpfStatus::None, "invalid domain");
        }

        // An empty or local-part-less sender becomes postmaster@domain.
        let sender = if sender.is_empty() || !sender.contains('@') || sender.starts_with('@') {
            format!("postmaster@{domain}")
        } else {
            sender.to_string()
        };

        let now = crate::dkim::unix_now();

        let record = match self.lookup_record(domain).await {
            Ok(record) => record,
            Err(e) => return e.into(),
        };

        match self
            .eval_record(&record, ip, domain, &sender, helo, now, 0)
            .await
        {
            Ok(result) => result,
            Err(e) => e.into(),
        }
    }

    // --- counters ---

    fn count_term(&mut self) -> Result<(), SpfError> {
        self.term_count += 1;
        if self.term_count > MAX_DNS_TERMS {
            return Err(SpfError::permerror("DNS mechanism limit exceeded"));
        }
        Ok(())
    }

    fn count_void(&mut self) -> Result<(), SpfError> {
        self.void_count += 1;
        if self.void_count > MAX_VOID_LOOKUPS {
            return Err(SpfError::permerror("void lookup limit exceeded"));
        }
        Ok(())
    }

    // --- lookups ---
    //
    // Every lookup counts a void exactly once when NXDOMAIN or when its
    // (family-filtered) result is empty; timeouts and transport failures
    // surface as temperror.

    async fn lookup_txt(&mut self, name: &str) -> Result<Vec<String>, SpfError> {
        match self.dns.query_txt(name).await {
            Ok(records) => {
                if records.is_empty() {
                    self.count_void()?;
                }
                Ok(records)
            }
            Err(DnsError::NotFound) => {
                self.count_void()?;
                Ok(Vec::new())
            }
            Err(e) => Err(SpfError::temperror(format!("TXT lookup error: {e}"))),
        }
    }

    async fn lookup_ip(&mut self, name: &str) -> Result<Vec<IpAddr>, SpfError> {
        match self.dns.query_ip(name).await {
            Ok(addrs) => {
                if addrs.is_empty() {
                    self.count_void()?;
                }
                Ok(addrs)
            }
            Err(DnsError::NotFound) => {
                self.count_void()?;
                Ok(Vec::new())
            }
            Err(e) => Err(SpfError::temperror(format!("IP lookup error: {e}"))),
        }
    }

    async fn lookup_a(&mut self, name: &str) -> Result<Vec<IpAddr>, SpfError> {
        match self.dns.query_ip(name).await {
            Ok(addrs) => {
                let a: Vec<IpAddr> = addrs
                    .into_iter()
                    .filter(|ip| as_ipv4(*ip).is_some())
                    .collect();
                if a.is_empty() {
                    self.count_void()?;
                }
                Ok(a)
            }
            Err(DnsError::NotFound) => {
                self.count_void()?;
                Ok(Vec::new())
            }
            Err(e) => Err(SpfError::temperror(format!("A lookup error: {e}"))),
        }
    }

    async fn lookup_mx(&mut self, name: &str) -> Result<Vec<MxRecord>, SpfError> {
        match self.dns.query_mx(name).await {
            Ok(records) => {
                if records.is_empty() {
                    self.count_void()?;
                }
                Ok(records)
            }
            Err(DnsError::NotFound) => {
                self.count_void()?;
                Ok(Vec::new())
            }
            Err(e) => Err(SpfError::temperror(format!("MX lookup error: {e}"))),
        }
    }

    /// PTR lookups never hard-fail: transport errors come back as an empty
    /// answer (RFC 7208 §5.5 treats them as no match).
    async fn lookup_ptr(&mut self, addr: IpAddr) -> Result<Vec<String>, SpfError> {
        match self.dns.query_ptr(addr).await {
            Ok(names) => {
                if names.is_empty() {
                    self.count_void()?;
                }
                Ok(names)
            }
            Err(DnsError::NotFound) => {
                self.count_void()?;
                Ok(Vec::new())
            }
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Fetch and parse the SPF record of `domain`.
    async fn lookup_record(&mut self, domain: &str) -> Result<SpfRecord, SpfError> {
        let records = self.lookup_txt(domain).await?;

        let spf_records: Vec<&String> =
            records.iter().filter(|r| is_spf_record(r)).collect();
        if spf_records.len() > 1 {
            return Err(SpfError::permerror("multiple SPF records found"));
        }
        if let Some(record) = spf_records.first() {
            return SpfRecord::parse(record);
        }

        // A record that leads with the sentinel but failed the well-formed
        // check (duplicate sentinel, stray bytes) is a broken SPF record.
        for record in &records {
            if let Some(first) = record.trim().split_whitespace().next() {
                if first.eq_ignore_ascii_case("v=spf1") {
                    return Err(SpfError::permerror("malformed SPF record"));
                }
            }
        }
        Err(SpfError::none("no SPF record found"))
    }

    // --- evaluation ---

    async fn eval_record(
        &mut self,
        record: &SpfRecord,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
        now: i64,
        depth: usize,
    ) -> Result<SpfResult, SpfError> {
        if depth > MAX_DEPTH {
            return Err(SpfError::permerror("include/redirect depth exceeded"));
        }

        for entry in &record.mechanisms {
            if self
                .match_mechanism(entry, ip, domain, sender, helo, now, depth)
                .await?
            {
                trace!(mechanism = %entry.mechanism, "mechanism matched");
                let status = qualifier_status(entry.qualifier);
                let mut reason = format!("matched {}", entry.mechanism);
                if status == SpfStatus::Fail && !record.exp.is_empty() {
                    reason = self
                        .resolve_exp(&record.exp, ip, domain, sender, helo, now)
                        .await;
                }
                return Ok(SpfResult::new(status, reason));
            }
        }

        // redirect= applies only when nothing matched and the record has no
        // all mechanism.
        if let Some(target) = record.modifier(Modifier::Redirect) {
            if !record.all_exists {
                return self
                    .follow_redirect(target, ip, domain, sender, helo, now, depth)
                    .await;
            }
        }

        Ok(SpfResult::new(SpfStatus::Neutral, "no mechanism matched"))
    }

    #[allow(clippy::too_many_arguments)]
    async fn follow_redirect(
        &mut self,
        target: &str,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
        now: i64,
        depth: usize,
    ) -> Result<SpfResult, SpfError> {
        self.count_term()?;

        let expanded = self
            .expand_domain_spec(target, ip, domain, sender, helo, now, MacroPurpose::DomainSpec)
            .await?;

        if self.visited.contains(&expanded) {
            return Err(SpfError::permerror("circular reference detected in redirect"));
        }
        self.visited.insert(expanded.clone());

        let result = self
            .redirect_target(&expanded, ip, sender, helo, now, depth)
            .await;

        self.visited.remove(&expanded);
        result
    }

    async fn redirect_target(
        &mut self,
        expanded: &str,
        ip: IpAddr,
        sender: &str,
        helo: &str,
        now: i64,
        depth: usize,
    ) -> Result<SpfResult, SpfError> {
        let record = match self.lookup_record(expanded).await {
            Ok(record) => record,
            Err(e) if e.status == SpfStatus::None => {
                return Err(SpfError::permerror("redirect domain has no SPF record"));
            }
            Err(e) => return Err(e),
        };
        Box::pin(self.eval_record(&record, ip, expanded, sender, helo, now, depth + 1)).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn match_mechanism(
        &mut self,
        entry: &MechanismEntry,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
        now: i64,
        depth: usize,
    ) -> Result<bool, SpfError> {
        match entry.mechanism {
            Mechanism::All => Ok(true),

            Mechanism::Ip4 => {
                let (network, prefix) = parse_cidr_default(&entry.value, true)
                    .map_err(|e| SpfError::permerror(format!("invalid ip4: {e}")))?;
                let IpAddr::V4(network) = network else {
                    return Ok(false);
                };
                match as_ipv4(ip) {
                    Some(src) => Ok(ip4_in_network(src, network, prefix)),
                    None => Ok(false),
                }
            }

            Mechanism::Ip6 => {
                let (network, prefix) = parse_cidr_default(&entry.value, false)
                    .map_err(|e| SpfError::permerror(format!("invalid ip6: {e}")))?;
                let IpAddr::V6(network) = network else {
                    return Ok(false);
                };
                // An IPv4 or IPv4-mapped source never matches ip6.
                if as_ipv4(ip).is_some() {
                    return Ok(false);
                }
                let IpAddr::V6(src) = ip else {
                    return Ok(false);
                };
                Ok(ip6_in_network(src, network, prefix))
            }

            Mechanism::A => {
                self.count_term()?;
                let (host, v4bits, v6bits) = split_host_and_dual_cidr(&entry.value)
                    .map_err(|e| SpfError::permerror(format!("invalid a mechanism: {e}")))?;
                let host = if host.is_empty() {
                    domain.to_string()
                } else {
                    host
                };
                if !is_valid_domain_spec(&host) {
                    return Err(SpfError::permerror("invalid domain-spec in a mechanism"));
                }
                let expanded = self
                    .expand_domain_spec(
                        &host,
                        ip,
                        domain,
                        sender,
                        helo,
                        now,
                        MacroPurpose::DomainSpec,
                    )
                    .await?;

                let addrs = self.lookup_ip(&expanded).await?;
                Ok(addrs
                    .iter()
                    .any(|&addr| dual_cidr_match(ip, addr, v4bits, v6bits)))
            }

            Mechanism::Mx => {
                self.count_term()?;
                let (host, v4bits, v6bits) = split_host_and_dual_cidr(&entry.value)
                    .map_err(|e| SpfError::permerror(format!("invalid mx mechanism: {e}")))?;
                let host = if host.is_empty() {
                    domain.to_string()
                } else {
                    host
                };
                let expanded = self
                    .expand_domain_spec(
                        &host,
                        ip,
                        domain,
                        sender,
                        helo,
                        now,
                        MacroPurpose::DomainSpec,
                    )
                    .await?;

                let mxs = self.lookup_mx(&expanded).await?;
                // The MX targets fold into the global term budget: the
                // mechanism itself already consumed one.
                for _ in 1..mxs.len() {
                    self.count_term()?;
                }

                for mx in &mxs {
                    let addrs = self.lookup_ip(&mx.exchange).await?;
                    if addrs.len() > MAX_PTR_RECORDS {
                        return Err(SpfError::permerror(
                            "too many A/AAAA records for MX host",
                        ));
                    }
                    if addrs
                        .iter()
                        .any(|&addr| dual_cidr_match(ip, addr, v4bits, v6bits))
                    {
                        return Ok(true);
                    }
                }
                Ok(false)
            }

            Mechanism::Include => {
                self.count_term()?;
                if depth > MAX_DEPTH {
                    return Err(SpfError::permerror("include/redirect depth exceeded"));
                }
                let expanded = self
                    .expand_domain_spec(
                        &entry.value,
                        ip,
                        domain,
                        sender,
                        helo,
                        now,
                        MacroPurpose::DomainSpec,
                    )
                    .await?;

                if self.visited.contains(&expanded) {
                    return Err(SpfError::permerror("circular reference detected in include"));
                }
                self.visited.insert(expanded.clone());

                let outcome = self
                    .include_target(&expanded, ip, sender, helo, now, depth)
                    .await;

                self.visited.remove(&expanded);

                match outcome? {
                    SpfResult {
                        status: SpfStatus::Pass,
                        ..
                    } => Ok(true),
                    _ => Ok(false),
                }
            }

            Mechanism::Exists => {
                self.count_term()?;
                let (host, v4bits, v6bits) = split_host_and_dual_cidr(&entry.value)
                    .map_err(|e| SpfError::permerror(format!("invalid exists mechanism: {e}")))?;
                if v4bits.is_some() || v6bits.is_some() {
                    return Err(SpfError::permerror(
                        "exists mechanism domain-spec must not contain CIDR",
                    ));
                }
                let expanded = self
                    .expand_domain_spec(
                        &host,
                        ip,
                        domain,
                        sender,
                        helo,
                        now,
                        MacroPurpose::DomainSpec,
                    )
                    .await?;

                // exists always queries A, regardless of connection family.
                let addrs = self.lookup_a(&expanded).await?;
                Ok(!addrs.is_empty())
            }

            Mechanism::Ptr => {
                self.count_term()?;
                let mut targets = self.lookup_ptr(ip).await?;
                targets.truncate(MAX_PTR_RECORDS);
                // PTR answers fold into the term budget like MX targets.
                for _ in 1..targets.len() {
                    self.count_term()?;
                }

                let check_domain = if entry.value.is_empty() {
                    domain.to_string()
                } else {
                    entry.value.clone()
                };
                let expanded = self
                    .expand_domain_spec(
                        &check_domain,
                        ip,
                        domain,
                        sender,
                        helo,
                        now,
                        MacroPurpose::DomainSpec,
                    )
                    .await?;
                let expanded_lower = expanded.to_ascii_lowercase();

                for target in &targets {
                    let trimmed = target.trim_end_matches('.');
                    if !trimmed.to_ascii_lowercase().ends_with(&expanded_lower) {
                        continue;
                    }
                    // Validate the PTR name by forward resolution.
                    let Ok(mut addrs) = self.lookup_ip(trimmed).await else {
                        continue;
                    };
                    addrs.truncate(MAX_PTR_RECORDS);
                    if addrs.iter().any(|&addr| ips_equal(addr, ip)) {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    async fn include_target(
        &mut self,
        expanded: &str,
        ip: IpAddr,
        sender: &str,
        helo: &str,
        now: i64,
        depth: usize,
    ) -> Result<SpfResult, SpfError> {
        let record = match self.lookup_record(expanded).await {
            Ok(record) => record,
            Err(e) if e.status == SpfStatus::None => {
                return Err(SpfError::permerror("include domain has no SPF record"));
            }
            Err(e) => return Err(e),
        };
        Box::pin(self.eval_record(&record, ip, expanded, sender, helo, now, depth + 1)).await
    }

    /// Expand a domain-spec, resolving `%{p}` when present. The PTR lookup
    /// and its answers count against the term budget in domain-spec context
    /// but not in `exp=` context.
    #[allow(clippy::too_many_arguments)]
    async fn expand_domain_spec(
        &mut self,
        spec: &str,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
        now: i64,
        purpose: MacroPurpose,
    ) -> Result<String, SpfError> {
        let tokens = parse_macro_string(spec)
            .map_err(|e| SpfError::permerror(format!("macro expansion error: {e}")))?;

        let ptr_name = if tokens_reference_ptr(&tokens) {
            self.resolve_ptr_macro(ip, purpose).await?
        } else {
            String::new()
        };

        let ctx = MacroContext {
            ip,
            domain,
            sender,
            helo,
            receiver: domain,
            now,
        };
        let expanded = expand_tokens(&tokens, &ctx, &ptr_name, purpose)
            .map_err(|e| SpfError::permerror(format!("macro expansion error: {e}")))?;

        let expanded = expanded.trim().to_string();
        if expanded.is_empty() {
            return Err(SpfError::permerror("empty domain-spec after macro expansion"));
        }
        Ok(truncate_domain(expanded))
    }

    /// RFC 7208 §7.3: `%{p}` expands to the first PTR name whose forward
    /// lookup contains the client IP, or `"unknown"`.
    async fn resolve_ptr_macro(
        &mut self,
        ip: IpAddr,
        purpose: MacroPurpose,
    ) -> Result<String, SpfError> {
        if purpose == MacroPurpose::DomainSpec {
            self.count_term()?;
        }

        let mut records = match self.lookup_ptr(ip).await {
            Ok(records) => records,
            Err(_) => return Ok("unknown".to_string()),
        };
        records.truncate(MAX_PTR_RECORDS);

        if purpose == MacroPurpose::DomainSpec {
            for _ in 1..records.len() {
                self.count_term()?;
            }
        }

        for record in &records {
            let trimmed = record.trim_end_matches('.');
            let Ok(mut addrs) = self.lookup_ip(trimmed).await else {
                continue;
            };
            addrs.truncate(MAX_PTR_RECORDS);
            if addrs.iter().any(|&addr| ips_equal(addr, ip)) {
                return Ok(trimmed.to_string());
            }
        }
        Ok("unknown".to_string())
    }

    /// Resolve the `exp=` explanation for a failed match. Every failure
    /// along the way falls back silently to the default explanation.
    async fn resolve_exp(
        &mut self,
        exp: &str,
        ip: IpAddr,
        domain: &str,
        sender: &str,
        helo: &str,
        now: i64,
    ) -> String {
        const DEFAULT: &str = "DEFAULT";

        let target = match self
            .expand_domain_spec(exp, ip, domain, sender, helo, now, MacroPurpose::Exp)
            .await
        {
            Ok(target) => target,
            Err(e) => {
                debug!(reason = %e.reason, "exp= target expansion failed");
                return DEFAULT.to_string();
            }
        };

        let records = match self.lookup_txt(&target).await {
            Ok(records) => records,
            Err(_) => return DEFAULT.to_string(),
        };
        // Exactly one TXT record is required.
        if records.len() != 1 {
            return DEFAULT.to_string();
        }

        let tokens = match parse_macro_string(&records[0]) {
            Ok(tokens) => tokens,
            Err(_) => return DEFAULT.to_string(),
        };
        let ptr_name = if tokens_reference_ptr(&tokens) {
            match self.resolve_ptr_macro(ip, MacroPurpose::Exp).await {
                Ok(name) => name,
                Err(_) => "unknown".to_string(),
            }
        } else {
            String::new()
        };
        let ctx = MacroContext {
            ip,
            domain,
            sender,
            helo,
            receiver: domain,
            now,
        };
        let explanation = match expand_tokens(&tokens, &ctx, &ptr_name, MacroPurpose::Exp) {
            Ok(explanation) => explanation,
            Err(_) => return DEFAULT.to_string(),
        };

        if !explanation.is_ascii() {
            return DEFAULT.to_string();
        }
        explanation
    }
}

fn tokens_reference_ptr(tokens: &[MacroToken]) -> bool {
    tokens.iter().any(|t| {
        matches!(t, MacroToken::Macro(expr) if expr.letter.to_ascii_lowercase() == 'p')
    })
}

/// Address equality across the IPv4-mapped boundary.
fn ips_equal(a: IpAddr, b: IpAddr) -> bool {
    match (as_ipv4(a), as_ipv4(b)) {
        (Some(a4), Some(b4)) => a4 == b4,
        (None, None) => a == b,
        _ => false,
    }
}

fn qualifier_status(q: Qualifier) -> SpfStatus {
    match q {
        Qualifier::Pass => SpfStatus::Pass,
        Qualifier::Fail => SpfStatus::Fail,
        Qualifier::SoftFail => SpfStatus::SoftFail,
        Qualifier::Neutral => SpfStatus::Neutral,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::dns::MockResolver;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn check(resolver: &MockResolver, client: &str, domain: &str) -> SpfResult {
        check_host(
            resolver,
            ip(client),
            domain,
            &format!("user@{domain}"),
            "mail.example.org",
        )
        .await
    }

    fn txt(resolver: &MockResolver, name: &str, value: &str) {
        resolver.add_txt(name, vec![value.to_string()]);
    }

    // --- terminal statuses ---

    #[tokio::test]
    async fn minus_all_fails() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 -all");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::Fail);
        assert_eq!(result.reason, "matched all");
    }

    #[tokio::test]
    async fn tilde_all_softfails() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ~all");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::SoftFail);
    }

    #[tokio::test]
    async fn no_record_is_none() {
        let resolver = MockResolver::new();
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::None);
    }

    #[tokio::test]
    async fn invalid_domain_is_none() {
        let resolver = MockResolver::new();
        let result = check(&resolver, "192.0.2.1", "not_a_domain").await;
        assert_eq!(result.status, SpfStatus::None);
        assert_eq!(result.reason, "invalid domain");
    }

    #[tokio::test]
    async fn no_match_is_neutral() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ip4:198.51.100.0/24");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::Neutral);
    }

    #[tokio::test]
    async fn multiple_spf_records_is_permerror() {
        let resolver = MockResolver::new();
        resolver.add_txt(
            "example.com",
            vec!["v=spf1 -all".to_string(), "v=spf1 +all".to_string()],
        );
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
    }

    // --- ip4/ip6 ---

    #[tokio::test]
    async fn ip4_network_match() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ip4:192.0.2.0/24 -all");
        assert_eq!(
            check(&resolver, "192.0.2.99", "example.com").await.status,
            SpfStatus::Pass
        );
        assert_eq!(
            check(&resolver, "198.51.100.1", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    #[tokio::test]
    async fn ip6_network_match() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ip6:2001:db8::/32 -all");
        assert_eq!(
            check(&resolver, "2001:db8::1", "example.com").await.status,
            SpfStatus::Pass
        );
        assert_eq!(
            check(&resolver, "2001:db9::1", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    #[tokio::test]
    async fn ip4_mapped_source_matches_ip4() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ip4:192.0.2.0/24 -all");
        assert_eq!(
            check(&resolver, "::ffff:192.0.2.7", "example.com").await.status,
            SpfStatus::Pass
        );
    }

    #[tokio::test]
    async fn ip4_mapped_source_never_matches_ip6() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ip6:::ffff:0.0.0.0/96 -all");
        assert_eq!(
            check(&resolver, "::ffff:192.0.2.7", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    // --- a / mx ---

    #[tokio::test]
    async fn a_mechanism_match() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 a -all");
        resolver.add_ip("example.com", vec![ip("192.0.2.10")]);
        assert_eq!(
            check(&resolver, "192.0.2.10", "example.com").await.status,
            SpfStatus::Pass
        );
        assert_eq!(
            check(&resolver, "192.0.2.11", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    #[tokio::test]
    async fn a_mechanism_with_cidr() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 a:other.example.com/24 -all");
        resolver.add_ip("other.example.com", vec![ip("192.0.2.10")]);
        assert_eq!(
            check(&resolver, "192.0.2.200", "example.com").await.status,
            SpfStatus::Pass
        );
    }

    #[tokio::test]
    async fn mx_mechanism_match() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 mx -all");
        resolver.add_mx(
            "example.com",
            vec![MxRecord {
                preference: 10,
                exchange: "mail.example.com".to_string(),
            }],
        );
        resolver.add_ip("mail.example.com", vec![ip("192.0.2.20")]);
        assert_eq!(
            check(&resolver, "192.0.2.20", "example.com").await.status,
            SpfStatus::Pass
        );
    }

    // --- include / redirect ---

    #[tokio::test]
    async fn include_pass_matches() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 include:_spf.example.com -all");
        txt(&resolver, "_spf.example.com", "v=spf1 ip4:10.0.0.0/8 -all");
        assert_eq!(
            check(&resolver, "10.1.2.3", "example.com").await.status,
            SpfStatus::Pass
        );
    }

    #[tokio::test]
    async fn include_fail_does_not_match() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 include:_spf.example.com ~all");
        txt(&resolver, "_spf.example.com", "v=spf1 -all");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::SoftFail);
    }

    #[tokio::test]
    async fn include_without_record_is_permerror() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 include:nothing.example.com -all");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
        assert_eq!(result.reason, "include domain has no SPF record");
    }

    #[tokio::test]
    async fn include_cycle_is_permerror() {
        let resolver = MockResolver::new();
        txt(&resolver, "a.example.com", "v=spf1 include:b.example.com -all");
        txt(&resolver, "b.example.com", "v=spf1 include:a.example.com -all");
        let result = check(&resolver, "192.0.2.1", "a.example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
    }

    #[tokio::test]
    async fn redirect_followed_when_nothing_matches() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 redirect=_spf.example.com");
        txt(&resolver, "_spf.example.com", "v=spf1 ip4:10.0.0.0/8 -all");
        assert_eq!(
            check(&resolver, "10.0.0.1", "example.com").await.status,
            SpfStatus::Pass
        );
        assert_eq!(
            check(&resolver, "192.0.2.1", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    #[tokio::test]
    async fn redirect_ignored_when_all_present() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 ~all redirect=_spf.example.com",
        );
        txt(&resolver, "_spf.example.com", "v=spf1 +all");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::SoftFail);
    }

    #[tokio::test]
    async fn redirect_without_record_is_permerror() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 redirect=nothing.example.com");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
    }

    // --- exists / ptr ---

    #[tokio::test]
    async fn exists_matches_on_a_record() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 exists:%{ir}._spf.example.com -all",
        );
        resolver.add_ip("1.2.0.192._spf.example.com", vec![ip("127.0.0.2")]);
        assert_eq!(
            check(&resolver, "192.0.2.1", "example.com").await.status,
            SpfStatus::Pass
        );
        assert_eq!(
            check(&resolver, "192.0.2.9", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    #[tokio::test]
    async fn exists_with_cidr_is_permerror() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 exists:x.example.com/24 -all");
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
    }

    #[tokio::test]
    async fn ptr_mechanism_validated_forward() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ptr -all");
        resolver.add_ptr(ip("192.0.2.30"), vec!["mx.example.com.".to_string()]);
        resolver.add_ip("mx.example.com", vec![ip("192.0.2.30")]);
        assert_eq!(
            check(&resolver, "192.0.2.30", "example.com").await.status,
            SpfStatus::Pass
        );
    }

    #[tokio::test]
    async fn ptr_not_validated_does_not_match() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 ptr -all");
        resolver.add_ptr(ip("192.0.2.30"), vec!["mx.example.com.".to_string()]);
        // Forward lookup resolves elsewhere.
        resolver.add_ip("mx.example.com", vec![ip("198.51.100.1")]);
        assert_eq!(
            check(&resolver, "192.0.2.30", "example.com").await.status,
            SpfStatus::Fail
        );
    }

    // --- budgets ---

    /// Register `count` non-matching, non-void `a:` targets.
    fn add_decoy_hosts(resolver: &MockResolver, prefix: &str, count: usize) -> String {
        let mut terms = String::new();
        for i in 0..count {
            terms.push_str(&format!(" a:{prefix}{i}.example.com"));
            resolver.add_ip(&format!("{prefix}{i}.example.com"), vec![ip("203.0.113.99")]);
        }
        terms
    }

    #[tokio::test]
    async fn ten_terms_exactly_is_allowed() {
        let resolver = MockResolver::new();
        let record = format!("v=spf1{} ~all", add_decoy_hosts(&resolver, "n", 10));
        txt(&resolver, "example.com", &record);
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::SoftFail);
    }

    #[tokio::test]
    async fn eleven_terms_is_permerror() {
        let resolver = MockResolver::new();
        let record = format!("v=spf1{} ~all", add_decoy_hosts(&resolver, "n", 11));
        txt(&resolver, "example.com", &record);
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
        assert_eq!(result.reason, "DNS mechanism limit exceeded");
    }

    #[tokio::test]
    async fn third_void_lookup_is_permerror() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 exists:a.example.com exists:b.example.com exists:c.example.com -all",
        );
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
        assert_eq!(result.reason, "void lookup limit exceeded");
    }

    #[tokio::test]
    async fn two_void_lookups_are_tolerated() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 exists:a.example.com exists:b.example.com ~all",
        );
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::SoftFail);
    }

    #[tokio::test]
    async fn included_lookups_share_the_budget() {
        let resolver = MockResolver::new();
        // 6 terms locally, one for the include, 4 more inside: the 11th
        // term trips the shared budget from within the included record.
        let outer = format!(
            "v=spf1{} include:inner.example.com -all",
            add_decoy_hosts(&resolver, "o", 6)
        );
        let inner = format!("v=spf1{} -all", add_decoy_hosts(&resolver, "i", 4));
        txt(&resolver, "example.com", &outer);
        txt(&resolver, "inner.example.com", &inner);
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
        assert_eq!(result.reason, "DNS mechanism limit exceeded");
    }

    #[tokio::test]
    async fn recursion_depth_limited() {
        let resolver = MockResolver::new();
        // A chain of redirects deeper than 10 without repeating a domain.
        for i in 0..12 {
            txt(
                &resolver,
                &format!("d{i}.example.com"),
                &format!("v=spf1 redirect=d{}.example.com", i + 1),
            );
        }
        let result = check(&resolver, "192.0.2.1", "d0.example.com").await;
        assert_eq!(result.status, SpfStatus::PermError);
    }

    // --- exp= ---

    #[tokio::test]
    async fn exp_sets_failure_reason() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 -all exp=explain.example.com",
        );
        resolver.add_txt(
            "explain.example.com",
            vec!["%{s} is not allowed to send mail".to_string()],
        );
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::Fail);
        assert_eq!(
            result.reason,
            "user@example.com is not allowed to send mail"
        );
    }

    #[tokio::test]
    async fn exp_lookup_failure_falls_back_to_default() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 -all exp=missing.example.com",
        );
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::Fail);
        assert_eq!(result.reason, "DEFAULT");
    }

    #[tokio::test]
    async fn exp_multiple_records_falls_back_to_default() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 -all exp=explain.example.com",
        );
        resolver.add_txt(
            "explain.example.com",
            vec!["one".to_string(), "two".to_string()],
        );
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.reason, "DEFAULT");
    }

    #[tokio::test]
    async fn exp_invalid_macro_falls_back_to_default() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 -all exp=explain.example.com",
        );
        resolver.add_txt("explain.example.com", vec!["broken %{x} macro".to_string()]);
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.reason, "DEFAULT");
    }

    #[tokio::test]
    async fn exp_not_used_on_softfail() {
        let resolver = MockResolver::new();
        txt(
            &resolver,
            "example.com",
            "v=spf1 ~all exp=explain.example.com",
        );
        resolver.add_txt("explain.example.com", vec!["nope".to_string()]);
        let result = check(&resolver, "192.0.2.1", "example.com").await;
        assert_eq!(result.status, SpfStatus::SoftFail);
        assert_eq!(result.reason, "matched all");
    }

    // --- sender preprocessing ---

    #[tokio::test]
    async fn empty_sender_becomes_postmaster() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 -all exp=e.example.com");
        resolver.add_txt("e.example.com", vec!["%{l} at %{o}".to_string()]);
        let result = check_host(
            &resolver,
            ip("192.0.2.1"),
            "example.com",
            "",
            "helo.example.org",
        )
        .await;
        assert_eq!(result.reason, "postmaster at example.com");
    }

    // --- counters accessor ---

    #[tokio::test]
    async fn evaluator_exposes_counters() {
        let resolver = MockResolver::new();
        txt(&resolver, "example.com", "v=spf1 exists:x.example.com ~all");
        let mut evaluator = SpfEvaluator::new(&resolver);
        let _ = evaluator
            .check_host(ip("192.0.2.1"), "example.com", "u@example.com", "h")
            .await;
        assert_eq!(evaluator.term_count(), 1);
        assert_eq!(evaluator.void_count(), 1);
    }
}
