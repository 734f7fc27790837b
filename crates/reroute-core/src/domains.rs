//! Intercepted domain suffixes
//!
//! Decides which hosts have their TLS tunnels decrypted. Matching is a
//! case-insensitive suffix test anchored on a leading dot, so `.example.com`
//! matches `api.example.com` but neither `example.com` nor `notexample.com`.

use crate::error::ConfigError;

/// Domains redirected when no configuration overrides them
pub const DEFAULT_INTERCEPTED_DOMAINS: &[&str] = &[
    ".bhsr.com",
    ".starrails.com",
    ".hoyoverse.com",
    ".mihoyo.com",
];

/// Immutable, ordered set of domain suffixes whose traffic gets intercepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptedDomainSet {
    /// Normalized suffixes: lowercase, always starting with a dot
    suffixes: Vec<String>,
}

impl InterceptedDomainSet {
    /// Build a domain set from configured suffixes.
    ///
    /// Entries are trimmed and lowercased. An entry without a leading dot
    /// gets one, so `example.com` behaves exactly like `.example.com`.
    pub fn new<I, S>(suffixes: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = Vec::new();

        for raw in suffixes {
            let suffix = raw.as_ref().trim().to_ascii_lowercase();
            let bare = suffix.trim_start_matches('.');
            if bare.is_empty() {
                return Err(ConfigError::EmptyDomainSuffix);
            }

            let suffix = format!(".{}", bare);
            if !normalized.contains(&suffix) {
                normalized.push(suffix);
            }
        }

        Ok(Self {
            suffixes: normalized,
        })
    }

    /// Returns true if the hostname ends with any configured suffix
    pub fn should_intercept(&self, hostname: &str) -> bool {
        if hostname.is_empty() {
            return false;
        }

        let host = hostname.to_ascii_lowercase();
        self.suffixes.iter().any(|suffix| host.ends_with(suffix))
    }

    /// The normalized suffixes, in configuration order
    pub fn suffixes(&self) -> &[String] {
        &self.suffixes
    }

    pub fn len(&self) -> usize {
        self.suffixes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.suffixes.is_empty()
    }
}

impl Default for InterceptedDomainSet {
    fn default() -> Self {
        Self {
            suffixes: DEFAULT_INTERCEPTED_DOMAINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(suffixes: &[&str]) -> InterceptedDomainSet {
        InterceptedDomainSet::new(suffixes.iter().copied()).unwrap()
    }

    #[test]
    fn test_subdomain_matches() {
        let domains = set(&[".bhsr.com"]);
        assert!(domains.should_intercept("api.bhsr.com"));
        assert!(domains.should_intercept("deep.sub.bhsr.com"));
    }

    #[test]
    fn test_case_insensitive() {
        let domains = set(&[".Example.COM"]);
        assert!(domains.should_intercept("API.EXAMPLE.com"));
        assert!(domains.should_intercept("www.example.com"));
    }

    #[test]
    fn test_no_substring_matches() {
        let domains = set(&[".example.com"]);

        // Shares a substring but not the dot-anchored suffix
        assert!(!domains.should_intercept("notexample.com"));
        assert!(!domains.should_intercept("evil-example.com"));
        assert!(!domains.should_intercept("example.com.evil.com"));
        assert!(!domains.should_intercept("example.comx"));
    }

    #[test]
    fn test_bare_domain_does_not_match() {
        let domains = set(&[".example.com"]);
        assert!(!domains.should_intercept("example.com"));
    }

    #[test]
    fn test_empty_hostname_never_matches() {
        let domains = set(&[".example.com"]);
        assert!(!domains.should_intercept(""));
    }

    #[test]
    fn test_missing_leading_dot_is_added() {
        let domains = set(&["example.com"]);
        assert_eq!(domains.suffixes(), &[".example.com".to_string()]);
        assert!(domains.should_intercept("api.example.com"));
        assert!(!domains.should_intercept("notexample.com"));
    }

    #[test]
    fn test_duplicates_collapse() {
        let domains = set(&[".a.com", "A.com", ".b.com"]);
        assert_eq!(domains.len(), 2);
        assert_eq!(domains.suffixes()[0], ".a.com");
        assert_eq!(domains.suffixes()[1], ".b.com");
    }

    #[test]
    fn test_empty_suffix_rejected() {
        assert!(matches!(
            InterceptedDomainSet::new([" . "]),
            Err(ConfigError::EmptyDomainSuffix)
        ));
        assert!(matches!(
            InterceptedDomainSet::new([""]),
            Err(ConfigError::EmptyDomainSuffix)
        ));
    }

    #[test]
    fn test_default_set() {
        let domains = InterceptedDomainSet::default();
        assert_eq!(domains.len(), DEFAULT_INTERCEPTED_DOMAINS.len());
        assert!(domains.should_intercept("sdk.hoyoverse.com"));
        assert!(domains.should_intercept("api-os-takumi.mihoyo.com"));
        assert!(domains.should_intercept("globaldp-prod-os01.starrails.com"));
        assert!(!domains.should_intercept("github.com"));
    }

    #[test]
    fn test_empty_set_matches_nothing() {
        let domains = InterceptedDomainSet::new(Vec::<String>::new()).unwrap();
        assert!(domains.is_empty());
        assert!(!domains.should_intercept("api.example.com"));
    }
}
