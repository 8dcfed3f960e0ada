//! Configuration for the front-end proxy.
//!
//! A [`FrontConfig`] is assembled through [`FrontConfigBuilder`],
//! which validates and freezes it before the serving side ever sees
//! it. Route rules are an ordered sequence; the order is what breaks
//! ties between prefixes of equal length.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

const DEFAULT_NON_HTTPS_ADDR: &str = ":80";
const DEFAULT_HTTPS_ADDR: &str = ":443";
const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(3 * 60);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PROBE_CONCURRENCY: usize = 5;

/// One routing rule: a URL path prefix and the backend origins that
/// serve it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RouteRule {
    pub prefix: String,
    pub backends: Vec<String>,
}

impl RouteRule {
    pub fn new<S: Into<String>>(prefix: S, backends: Vec<String>) -> Self {
        Self {
            prefix: prefix.into(),
            backends,
        }
    }
}

/// Frozen configuration for [`listen`](crate::server::listen).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FrontConfig {
    /// Run as a plain HTTP/1 server on a single local address,
    /// disabling TLS and the domain requirement.
    pub http1: bool,

    /// Bare hostnames the front-end serves over TLS.
    pub domains: Vec<String>,

    /// Suppress synthesis of `www.<domain>` variants.
    pub no_auto_www: bool,

    /// Flat backend list, interpreted as the catch-all prefix `/`.
    pub proxy_addresses: Vec<String>,

    /// Prefix-routed backends, in insertion order.
    #[serde(rename = "routing")]
    pub prefix_router: Vec<RouteRule>,

    /// Bind address for the plain-HTTP endpoint.
    pub non_https_addr: String,

    /// When set, the plain-HTTP endpoint permanently redirects every
    /// request here; when empty the endpoint is not started.
    pub non_https_redirect_url: String,

    /// Bind address for the built-in TLS listener.
    pub https_addr: String,

    /// PEM certificate chain for the built-in TLS listener.
    pub tls_cert: Option<PathBuf>,
    /// PEM private key for the built-in TLS listener.
    pub tls_key: Option<PathBuf>,

    /// Period between backend liveliness cycles.
    #[serde(with = "humantime_serde")]
    pub backend_ping_period: Duration,

    /// Per-probe transport timeout.
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,

    /// Bounded parallelism of each liveliness round.
    pub probe_concurrency: usize,

    /// Fixed shuffle seed; leave unset outside of tests.
    pub shuffle_seed: Option<u64>,
}

impl Default for FrontConfig {
    fn default() -> Self {
        Self {
            http1: false,
            domains: Vec::new(),
            no_auto_www: false,
            proxy_addresses: Vec::new(),
            prefix_router: Vec::new(),
            non_https_addr: DEFAULT_NON_HTTPS_ADDR.to_string(),
            non_https_redirect_url: String::new(),
            https_addr: DEFAULT_HTTPS_ADDR.to_string(),
            tls_cert: None,
            tls_key: None,
            backend_ping_period: DEFAULT_PING_PERIOD,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_concurrency: DEFAULT_PROBE_CONCURRENCY,
            shuffle_seed: None,
        }
    }
}

impl FrontConfig {
    pub fn builder() -> FrontConfigBuilder {
        FrontConfigBuilder {
            cfg: FrontConfig::default(),
        }
    }

    /// Whether TLS mode (and therefore a domain list) is required.
    pub fn needs_domains(&self) -> bool {
        !self.http1
    }

    fn has_at_least_one_proxy(&self) -> bool {
        let flat = self
            .proxy_addresses
            .iter()
            .any(|addr| !addr.trim().is_empty());
        let routed = self
            .prefix_router
            .iter()
            .any(|rule| rule.backends.iter().any(|addr| !addr.trim().is_empty()));
        flat || routed
    }

    /// Validate the configuration ahead of listening.
    pub fn validate(&self) -> Result<()> {
        if !self.has_at_least_one_proxy() {
            return Err(Error::NoProxy);
        }
        if self.needs_domains() && !self.domains.iter().any(|d| !d.trim().is_empty()) {
            return Err(Error::NoDomains);
        }
        Ok(())
    }

    /// Produce the effective domain list: trimmed, deduplicated in
    /// first-occurrence order, with `www.` variants inserted unless
    /// suppressed.
    pub fn synthesize_domains(&self) -> Vec<String> {
        let mut finalized: Vec<String> = Vec::new();
        for raw in &self.domains {
            let domain = raw.trim();
            if domain.is_empty() {
                continue;
            }

            let mut to_add = vec![domain.to_string()];
            if !self.no_auto_www && !domain.starts_with("www.") {
                to_add.push(format!("www.{}", domain));
            }

            for candidate in to_add {
                if !finalized.contains(&candidate) {
                    finalized.push(candidate);
                }
            }
        }
        finalized
    }

    /// Merge the flat proxy list into the routed rules: flat backends
    /// belong to the catch-all `/` rule, appended to an existing one
    /// if the configuration already routes `/`.
    pub fn effective_routes(&self) -> Vec<RouteRule> {
        let mut rules = self.prefix_router.clone();
        let flat: Vec<String> = self
            .proxy_addresses
            .iter()
            .filter(|addr| !addr.trim().is_empty())
            .cloned()
            .collect();
        if !flat.is_empty() {
            match rules.iter_mut().find(|rule| rule.prefix == "/") {
                Some(rule) => rule.backends.extend(flat),
                None => rules.push(RouteRule::new("/", flat)),
            }
        }
        rules
    }
}

/// Builder that freezes a validated [`FrontConfig`].
#[derive(Debug, Clone, Default)]
pub struct FrontConfigBuilder {
    cfg: FrontConfig,
}

impl FrontConfigBuilder {
    pub fn http1(mut self, http1: bool) -> Self {
        self.cfg.http1 = http1;
        self
    }

    pub fn domain<S: Into<String>>(mut self, domain: S) -> Self {
        self.cfg.domains.push(domain.into());
        self
    }

    pub fn domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg.domains.extend(domains.into_iter().map(Into::into));
        self
    }

    pub fn no_auto_www(mut self, no_auto_www: bool) -> Self {
        self.cfg.no_auto_www = no_auto_www;
        self
    }

    pub fn proxy_address<S: Into<String>>(mut self, addr: S) -> Self {
        self.cfg.proxy_addresses.push(addr.into());
        self
    }

    pub fn proxy_addresses<I, S>(mut self, addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cfg
            .proxy_addresses
            .extend(addrs.into_iter().map(Into::into));
        self
    }

    pub fn route<S: Into<String>>(mut self, prefix: S, backends: Vec<String>) -> Self {
        self.cfg.prefix_router.push(RouteRule::new(prefix, backends));
        self
    }

    pub fn routes<I>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = RouteRule>,
    {
        self.cfg.prefix_router.extend(rules);
        self
    }

    pub fn non_https_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.cfg.non_https_addr = addr.into();
        self
    }

    pub fn non_https_redirect_url<S: Into<String>>(mut self, url: S) -> Self {
        self.cfg.non_https_redirect_url = url.into();
        self
    }

    pub fn https_addr<S: Into<String>>(mut self, addr: S) -> Self {
        self.cfg.https_addr = addr.into();
        self
    }

    pub fn tls_files<P: Into<PathBuf>>(mut self, cert: P, key: P) -> Self {
        self.cfg.tls_cert = Some(cert.into());
        self.cfg.tls_key = Some(key.into());
        self
    }

    pub fn backend_ping_period(mut self, period: Duration) -> Self {
        self.cfg.backend_ping_period = period;
        self
    }

    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.cfg.probe_timeout = timeout;
        self
    }

    pub fn probe_concurrency(mut self, concurrency: usize) -> Self {
        self.cfg.probe_concurrency = concurrency;
        self
    }

    pub fn shuffle_seed(mut self, seed: u64) -> Self {
        self.cfg.shuffle_seed = Some(seed);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<FrontConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Load routing rules from a comma-delimited file.
///
/// One rule per line, `<prefix>,<backend>[,<backend>...]`; blank
/// lines and `#` comments are skipped. Line order is preserved and
/// becomes the tie-break order of the route table.
pub fn load_route_file(path: &Path) -> Result<Vec<RouteRule>> {
    let content = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("route file {}: {}", path.display(), e)))?;

    let mut rules = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split(',').map(str::trim);
        let prefix = match fields.next() {
            Some(prefix) if !prefix.is_empty() => prefix.to_string(),
            _ => {
                return Err(Error::config(format!(
                    "route file {} line {}: missing prefix",
                    path.display(),
                    lineno + 1
                )))
            }
        };
        let backends: Vec<String> = fields
            .filter(|field| !field.is_empty())
            .map(str::to_string)
            .collect();
        if backends.is_empty() {
            return Err(Error::config(format!(
                "route file {} line {}: no backends for {:?}",
                path.display(),
                lineno + 1,
                prefix
            )));
        }
        rules.push(RouteRule::new(prefix, backends));
    }
    Ok(rules)
}

/// Normalize Go-style `:port` shorthand into a bindable address.
pub(crate) fn normalize_bind_addr(addr: &str) -> String {
    let addr = addr.trim();
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}
