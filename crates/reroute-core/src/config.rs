//! Configuration management for Reroute
//!
//! Read from OS-appropriate locations:
//! - macOS: ~/Library/Application Support/reroute/config.toml
//! - Linux: ~/.config/reroute/config.toml
//! - Windows: %APPDATA%\reroute\config.toml
//!
//! A missing file means built-in defaults. Nothing is written implicitly.

use crate::domains::{InterceptedDomainSet, DEFAULT_INTERCEPTED_DOMAINS};
use crate::error::ConfigError;
use crate::redirect::{RedirectPolicy, RedirectTarget, DEFAULT_GATEWAY_MARKER};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Reroute configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RerouteConfig {
    /// Listener configuration
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Redirect target and rules
    #[serde(default)]
    pub redirect: RedirectSettings,

    /// Root certificate configuration
    #[serde(default)]
    pub tls: TlsSettings,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Address to listen on
    #[serde(default = "default_listen_host")]
    pub listen_host: String,

    /// Port to listen on
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Register as the system HTTP/HTTPS proxy while running
    #[serde(default = "default_true")]
    pub configure_system_proxy: bool,

    /// Seconds to let in-flight connections drain on shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            configure_system_proxy: default_true(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_listen_host() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout() -> u64 {
    5
}

/// Redirect target and rules
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedirectSettings {
    /// Gateway host that matching requests are sent to
    #[serde(default = "default_redirect_host")]
    pub host: String,

    /// Gateway port
    #[serde(default = "default_redirect_port")]
    pub port: u16,

    /// Domain suffixes whose TLS is decrypted and whose requests are redirected
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,

    /// Host of the gateway path rule (defaults to `host`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_host: Option<String>,

    /// Path marker of the gateway path rule
    #[serde(default = "default_gateway_marker")]
    pub gateway_marker: String,
}

impl Default for RedirectSettings {
    fn default() -> Self {
        Self {
            host: default_redirect_host(),
            port: default_redirect_port(),
            domains: default_domains(),
            gateway_host: None,
            gateway_marker: default_gateway_marker(),
        }
    }
}

fn default_redirect_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redirect_port() -> u16 {
    8888
}

fn default_domains() -> Vec<String> {
    DEFAULT_INTERCEPTED_DOMAINS
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_gateway_marker() -> String {
    DEFAULT_GATEWAY_MARKER.to_string()
}

impl RedirectSettings {
    /// Host the gateway path rule applies to
    pub fn effective_gateway_host(&self) -> &str {
        self.gateway_host.as_deref().unwrap_or(&self.host)
    }

    /// Build the redirect policy these settings describe
    pub fn to_policy(&self) -> Result<RedirectPolicy, ConfigError> {
        let domains = InterceptedDomainSet::new(&self.domains)?;
        let target = RedirectTarget::new(self.host.clone(), self.port)?;
        RedirectPolicy::with_gateway(
            domains,
            target,
            self.effective_gateway_host(),
            self.gateway_marker.clone(),
        )
    }
}

/// Root certificate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Keep the root CA on disk so clients only have to trust it once
    #[serde(default = "default_true")]
    pub persist_ca: bool,

    /// PEM file of the root CA certificate (defaults to the config directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,

    /// PEM file of the root CA private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_key_path: Option<PathBuf>,

    /// Number of generated leaf certificates to cache
    #[serde(default = "default_cache_size")]
    pub cache_size: u64,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            persist_ca: default_true(),
            ca_cert_path: None,
            ca_key_path: None,
            cache_size: default_cache_size(),
        }
    }
}

fn default_cache_size() -> u64 {
    1000
}

const CA_CERT_FILE: &str = "ca.crt";
const CA_KEY_FILE: &str = "ca.key";

impl TlsSettings {
    /// Where the root CA certificate and key live.
    ///
    /// Both configured paths win; otherwise `ca.crt`/`ca.key` in the reroute
    /// config directory. `None` means a throwaway CA for this run only.
    pub fn ca_paths(&self) -> Option<(PathBuf, PathBuf)> {
        if !self.persist_ca {
            return None;
        }

        match (&self.ca_cert_path, &self.ca_key_path) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => {
                let dir = dirs::config_dir()?.join("reroute");
                Some((dir.join(CA_CERT_FILE), dir.join(CA_KEY_FILE)))
            }
        }
    }
}

impl RerouteConfig {
    /// Get the config file path for the current OS
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("reroute");

        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Save configuration to a specific file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Apply `REROUTE_*` environment variable overrides
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("REROUTE_LISTEN_HOST") {
            self.proxy.listen_host = host;
        }

        if let Some(port) = lookup("REROUTE_LISTEN_PORT") {
            self.proxy.listen_port = port
                .parse()
                .with_context(|| format!("Invalid REROUTE_LISTEN_PORT '{}'", port))?;
        }

        if let Some(host) = lookup("REROUTE_REDIRECT_HOST") {
            self.redirect.host = host;
        }

        if let Some(port) = lookup("REROUTE_REDIRECT_PORT") {
            self.redirect.port = port
                .parse()
                .with_context(|| format!("Invalid REROUTE_REDIRECT_PORT '{}'", port))?;
        }

        Ok(())
    }

    /// Reject values that would make startup fail later
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy.listen_host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.proxy.listen_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        self.redirect.to_policy()?;
        Ok(())
    }
}
