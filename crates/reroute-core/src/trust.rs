//! Upstream certificate trust policy
//!
//! When a tunnel is decrypted the proxy validates the real server's
//! certificate on the client's behalf. The TLS layer reports what went wrong
//! as a set of [`CertPolicyError`]s; the policy trusts the certificate only
//! when that set is empty. There is no pinning and no override.

use std::collections::BTreeSet;
use std::fmt;

/// A single violation detected on an upstream certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CertPolicyError {
    /// The server presented no certificate
    RemoteCertificateNotAvailable,
    /// The certificate is not valid for the requested host name
    RemoteCertificateNameMismatch,
    /// The chain could not be built to a trusted root, or is otherwise invalid
    RemoteCertificateChainErrors,
}

impl fmt::Display for CertPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertPolicyError::RemoteCertificateNotAvailable => write!(f, "certificate not available"),
            CertPolicyError::RemoteCertificateNameMismatch => write!(f, "name mismatch"),
            CertPolicyError::RemoteCertificateChainErrors => write!(f, "chain errors"),
        }
    }
}

/// Set of violations reported for one upstream certificate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertPolicyErrors(BTreeSet<CertPolicyError>);

impl CertPolicyErrors {
    /// No violations
    pub fn none() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, error: CertPolicyError) {
        self.0.insert(error);
    }

    pub fn contains(&self, error: CertPolicyError) -> bool {
        self.0.contains(&error)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = CertPolicyError> + '_ {
        self.0.iter().copied()
    }
}

impl From<CertPolicyError> for CertPolicyErrors {
    fn from(error: CertPolicyError) -> Self {
        let mut errors = Self::none();
        errors.insert(error);
        errors
    }
}

impl FromIterator<CertPolicyError> for CertPolicyErrors {
    fn from_iter<I: IntoIterator<Item = CertPolicyError>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl fmt::Display for CertPolicyErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<String> = self.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", names.join(", "))
    }
}

/// Trust the upstream certificate iff no violations were reported
pub fn validate_upstream_certificate(errors: &CertPolicyErrors) -> bool {
    errors.is_empty()
}
