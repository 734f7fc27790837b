//! Redirect rules and request URL rewriting
//!
//! A [`RedirectPolicy`] owns the intercepted domain set, the redirect target
//! and an ordered list of [`RedirectRule`]s. For every decrypted request the
//! first matching rule wins; the request URL then keeps its path, query and
//! fragment while scheme, host and port are replaced by the target's.
//!
//! # Example
//!
//! ```
//! use reroute_core::{InterceptedDomainSet, RedirectPolicy, RedirectTarget};
//!
//! let domains = InterceptedDomainSet::new([".bhsr.com"]).unwrap();
//! let target = RedirectTarget::new("127.0.0.1", 8888).unwrap();
//! let policy = RedirectPolicy::new(domains, target);
//!
//! let decision = policy.build_rewrite("api.bhsr.com", "https://api.bhsr.com/v1/login?x=1");
//! assert_eq!(
//!     decision.rewritten_url(),
//!     Some("http://127.0.0.1:8888/v1/login?x=1")
//! );
//! ```

use crate::domains::InterceptedDomainSet;
use crate::error::{ConfigError, RewriteError};
use tracing::{info, warn};
use url::Url;

/// Path marker of the gateway lookup endpoint
pub const DEFAULT_GATEWAY_MARKER: &str = "query_gateway";

/// Scheme used to reach the redirect target
const TARGET_SCHEME: &str = "http";

/// The local gateway that matching traffic is sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectTarget {
    host: String,
    port: u16,
}

impl RedirectTarget {
    /// Create a redirect target, rejecting anything that is not a bare host
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into().trim().to_string();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        let host = url_host(&host);
        let invalid = || ConfigError::InvalidTarget(format!("{}:{}", host, port));

        let scratch = Url::parse(&format!("{}://{}:{}/", TARGET_SCHEME, host, port))
            .map_err(|_| invalid())?;

        // Stray characters in the host end up in userinfo, path or query
        let bare = scratch.username().is_empty()
            && scratch.password().is_none()
            && scratch.path() == "/"
            && scratch.query().is_none()
            && scratch.fragment().is_none()
            && scratch.port_or_known_default() == Some(port);

        match scratch.host_str() {
            Some(parsed) if bare => Ok(Self {
                host: parsed.to_string(),
                port,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Base URL of the target, e.g. `http://127.0.0.1:8888/`
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}/", TARGET_SCHEME, self.host, self.port)
    }

    fn authority(&self) -> String {
        if self.port == 80 {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Replace scheme, host and port of `request_url` with this target's.
    ///
    /// Everything after the authority is copied byte for byte: no percent
    /// encoding and no dot-segment removal.
    pub fn rewrite(&self, request_url: &str) -> Result<String, RewriteError> {
        let parsed = Url::parse(request_url).map_err(|source| RewriteError::UnparseableUrl {
            url: request_url.to_string(),
            source,
        })?;
        if parsed.host().is_none() {
            return Err(RewriteError::CannotReplaceAuthority(request_url.to_string()));
        }

        let (_, rest) = split_authority(request_url)
            .ok_or_else(|| RewriteError::CannotReplaceAuthority(request_url.to_string()))?;

        let mut url = format!("{}://{}", TARGET_SCHEME, self.authority());
        if !rest.starts_with('/') {
            url.push('/');
        }
        url.push_str(rest);
        Ok(url)
    }
}

/// Bracket a bare IPv6 literal so it can be used as a URL host
pub(crate) fn url_host(host: &str) -> String {
    let host = host.trim();
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Split an absolute URL into its authority and everything after it
fn split_authority(url: &str) -> Option<(&str, &str)> {
    let (_, rest) = url.split_once("://")?;
    let end = rest.find(['/', '?', '#', '\\']).unwrap_or(rest.len());
    Some(rest.split_at(end))
}

/// Path of an absolute URL as it was written
fn raw_path(url: &str) -> Option<&str> {
    let (_, rest) = split_authority(url)?;
    let end = rest.find(['?', '#']).unwrap_or(rest.len());
    Some(&rest[..end])
}

impl Default for RedirectTarget {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8888,
        }
    }
}

/// A condition under which a request is sent to the redirect target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectRule {
    /// Any request whose host is in the intercepted domain set
    InterceptedDomain,

    /// Requests to one specific host whose path contains a marker
    GatewayPath {
        /// Host the rule applies to (compared case-insensitively, IPv6 bracketed)
        host: String,
        /// Substring that must appear in the request path
        marker: String,
    },
}

impl RedirectRule {
    /// Build a gateway path rule
    pub fn gateway_path(
        host: impl Into<String>,
        marker: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let host: String = host.into();
        let host = url_host(&host);
        let marker = marker.into();
        if host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if marker.is_empty() {
            return Err(ConfigError::EmptyGatewayMarker);
        }
        Ok(Self::GatewayPath { host, marker })
    }

    /// Short name used in log events
    pub fn name(&self) -> &'static str {
        match self {
            RedirectRule::InterceptedDomain => "intercepted_domain",
            RedirectRule::GatewayPath { .. } => "gateway_path",
        }
    }

    /// Check whether this rule applies to a request.
    ///
    /// `path` is `None` when the request URL could not be parsed.
    fn matches(&self, domains: &InterceptedDomainSet, hostname: &str, path: Option<&str>) -> bool {
        match self {
            RedirectRule::InterceptedDomain => domains.should_intercept(hostname),
            RedirectRule::GatewayPath { host, marker } => {
                hostname.eq_ignore_ascii_case(host)
                    && path.is_some_and(|p| p.contains(marker.as_str()))
            }
        }
    }
}

/// Outcome of evaluating a single request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteDecision {
    /// Forward the request exactly as received
    Passthrough,

    /// Forward the request to `url` instead
    Rewrite {
        /// The rewritten absolute URL
        url: String,
    },
}

impl RewriteDecision {
    pub fn should_rewrite(&self) -> bool {
        matches!(self, RewriteDecision::Rewrite { .. })
    }

    pub fn rewritten_url(&self) -> Option<&str> {
        match self {
            RewriteDecision::Rewrite { url } => Some(url),
            RewriteDecision::Passthrough => None,
        }
    }
}

/// Immutable interception and redirect policy shared by all connections
#[derive(Debug, Clone)]
pub struct RedirectPolicy {
    domains: InterceptedDomainSet,
    target: RedirectTarget,
    rules: Vec<RedirectRule>,
}

impl RedirectPolicy {
    /// Policy that redirects every request to an intercepted domain
    pub fn new(domains: InterceptedDomainSet, target: RedirectTarget) -> Self {
        Self {
            domains,
            target,
            rules: vec![RedirectRule::InterceptedDomain],
        }
    }

    /// Policy with both the intercepted-domain rule and the gateway path rule
    pub fn with_gateway(
        domains: InterceptedDomainSet,
        target: RedirectTarget,
        gateway_host: impl Into<String>,
        gateway_marker: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let rule = RedirectRule::gateway_path(gateway_host, gateway_marker)?;
        Ok(Self::new(domains, target).with_rule(rule))
    }

    /// Append a rule; rules are evaluated in insertion order
    pub fn with_rule(mut self, rule: RedirectRule) -> Self {
        self.rules.push(rule);
        self
    }

    /// Whether the TLS tunnel to `hostname` should be decrypted
    pub fn should_intercept(&self, hostname: &str) -> bool {
        self.domains.should_intercept(hostname)
    }

    /// Decide whether a request should go to the redirect target, and where.
    ///
    /// Never fails: an unparseable URL is logged and passed through.
    pub fn build_rewrite(&self, hostname: &str, request_url: &str) -> RewriteDecision {
        let path = Url::parse(request_url)
            .ok()
            .and_then(|_| raw_path(request_url));

        let Some(rule) = self
            .rules
            .iter()
            .find(|rule| rule.matches(&self.domains, hostname, path))
        else {
            return RewriteDecision::Passthrough;
        };

        match self.target.rewrite(request_url) {
            Ok(url) => {
                info!(rule = rule.name(), "{} => redirected => {}", hostname, url);
                RewriteDecision::Rewrite { url }
            }
            Err(e) => {
                warn!(
                    host = %hostname,
                    rule = rule.name(),
                    error = %e,
                    "Leaving request unmodified"
                );
                RewriteDecision::Passthrough
            }
        }
    }

    pub fn domains(&self) -> &InterceptedDomainSet {
        &self.domains
    }

    pub fn target(&self) -> &RedirectTarget {
        &self.target
    }

    pub fn rules(&self) -> &[RedirectRule] {
        &self.rules
    }
}
