use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use hickory_resolver::config::ResolverConfig;
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;

/// DNS lookup failure as seen by the protocol engines.
///
/// `NotFound` covers NXDOMAIN; an empty-but-successful answer is reported as
/// `Ok(vec![])` and left to the caller (SPF counts both as void lookups).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    NotFound,
    Timeout,
    Other(String),
}

impl std::fmt::Display for DnsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsError::NotFound => write!(f, "no record found"),
            DnsError::Timeout => write!(f, "lookup timed out"),
            DnsError::Other(msg) => write!(f, "lookup failed: {msg}"),
        }
    }
}

impl std::error::Error for DnsError {}

/// A single MX answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

/// Capability bundle used by DKIM/ARC key retrieval and the SPF evaluator.
///
/// `query_txt` must concatenate multi-string TXT chunks without inserting
/// separators. `query_ip` returns a mixed A/AAAA list; callers filter by
/// family.
pub trait DnsResolver: Send + Sync {
    fn query_txt(&self, name: &str) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
    fn query_ip(&self, name: &str) -> impl Future<Output = Result<Vec<IpAddr>, DnsError>> + Send;
    fn query_mx(&self, name: &str) -> impl Future<Output = Result<Vec<MxRecord>, DnsError>> + Send;
    fn query_ptr(&self, addr: IpAddr) -> impl Future<Output = Result<Vec<String>, DnsError>> + Send;
}

/// Production resolver backed by hickory.
#[derive(Clone)]
pub struct HickoryResolver {
    resolver: TokioResolver,
}

impl HickoryResolver {
    pub fn new() -> Self {
        let resolver = TokioResolver::builder_with_config(
            ResolverConfig::cloudflare(),
            TokioConnectionProvider::default(),
        )
        .build();
        Self { resolver }
    }
}

impl Default for HickoryResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn map_resolve_error(e: hickory_resolver::ResolveError) -> DnsError {
    if e.is_nx_domain() || e.is_no_records_found() {
        DnsError::NotFound
    } else {
        DnsError::Other(e.to_string())
    }
}

impl DnsResolver for HickoryResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        match self.resolver.txt_lookup(name).await {
            // TXT chunks are concatenated without separators by Display.
            Ok(lookup) => Ok(lookup.iter().map(|txt| txt.to_string()).collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }

    async fn query_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        match self.resolver.lookup_ip(name).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        match self.resolver.mx_lookup(name).await {
            Ok(lookup) => Ok(lookup
                .iter()
                .map(|mx| MxRecord {
                    preference: mx.preference(),
                    exchange: mx.exchange().to_string(),
                })
                .collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }

    async fn query_ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        match self.resolver.reverse_lookup(addr).await {
            Ok(lookup) => Ok(lookup.iter().map(|name| name.to_string()).collect()),
            Err(e) => Err(map_resolve_error(e)),
        }
    }
}

/// In-memory resolver for deterministic tests.
///
/// Names are matched case-insensitively; anything not registered resolves to
/// [`DnsError::NotFound`].
#[derive(Clone, Default)]
pub struct MockResolver {
    txt_records: Arc<RwLock<HashMap<String, Vec<String>>>>,
    ip_records: Arc<RwLock<HashMap<String, Vec<IpAddr>>>>,
    mx_records: Arc<RwLock<HashMap<String, Vec<MxRecord>>>>,
    ptr_records: Arc<RwLock<HashMap<IpAddr, Vec<String>>>>,
}

impl MockResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_txt(&self, name: &str, records: Vec<String>) {
        self.txt_records
            .write()
            .unwrap()
            .insert(name.to_ascii_lowercase(), records);
    }

    pub fn add_ip(&self, name: &str, addrs: Vec<IpAddr>) {
        self.ip_records
            .write()
            .unwrap()
            .insert(name.to_ascii_lowercase(), addrs);
    }

    pub fn add_mx(&self, name: &str, records: Vec<MxRecord>) {
        self.mx_records
            .write()
            .unwrap()
            .insert(name.to_ascii_lowercase(), records);
    }

    pub fn add_ptr(&self, addr: IpAddr, names: Vec<String>) {
        self.ptr_records.write().unwrap().insert(addr, names);
    }
}

impl DnsResolver for MockResolver {
    async fn query_txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        self.txt_records
            .read()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }

    async fn query_ip(&self, name: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.ip_records
            .read()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }

    async fn query_mx(&self, name: &str) -> Result<Vec<MxRecord>, DnsError> {
        self.mx_records
            .read()
            .unwrap()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or(DnsError::NotFound)
    }

    async fn query_ptr(&self, addr: IpAddr) -> Result<Vec<String>, DnsError> {
        self.ptr_records
            .read()
            .unwrap()
            .get(&addr)
            .cloned()
            .ok_or(DnsError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_txt_roundtrip() {
        let resolver = MockResolver::new();
        resolver.add_txt("Example.COM", vec!["v=spf1 -all".to_string()]);
        let records = resolver.query_txt("example.com").await.unwrap();
        assert_eq!(records, vec!["v=spf1 -all"]);
    }

    #[tokio::test]
    async fn mock_missing_name_is_not_found() {
        let resolver = MockResolver::new();
        assert_eq!(
            resolver.query_txt("nothing.example").await.unwrap_err(),
            DnsError::NotFound
        );
    }

    #[tokio::test]
    async fn mock_ptr_by_address() {
        let resolver = MockResolver::new();
        let addr: IpAddr = "192.0.2.3".parse().unwrap();
        resolver.add_ptr(addr, vec!["mx.example.com.".to_string()]);
        let names = resolver.query_ptr(addr).await.unwrap();
        assert_eq!(names, vec!["mx.example.com."]);
    }
}
