//! Reroute Core - interception and redirect policy
//!
//! Everything here is pure and shared read-only across connections:
//! - Intercepted domain suffixes (which TLS tunnels get decrypted)
//! - Redirect rules and request URL rewriting
//! - Upstream certificate trust policy
//! - Proxy run state
//! - TOML configuration

pub mod config;
pub mod domains;
pub mod error;
pub mod redirect;
pub mod state;
pub mod trust;

pub use config::{ProxySettings, RedirectSettings, RerouteConfig, TlsSettings};
pub use domains::{InterceptedDomainSet, DEFAULT_INTERCEPTED_DOMAINS};
pub use error::{ConfigError, RewriteError};
pub use redirect::{
    RedirectPolicy, RedirectRule, RedirectTarget, RewriteDecision, DEFAULT_GATEWAY_MARKER,
};
pub use state::{RunState, RunStateCell};
pub use trust::{validate_upstream_certificate, CertPolicyError, CertPolicyErrors};
