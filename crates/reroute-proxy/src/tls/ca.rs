//! Root Certificate Authority for TLS interception
//!
//! The root CA signs the per-host certificates the engine presents to the
//! client for intercepted tunnels. It is normally loaded from (or created at)
//! PEM files in the config directory so it only has to be trusted once.

use super::TlsError;
use hudsucker::certificate_authority::RcgenAuthority;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, DnValue, IsCa,
    KeyPair, KeyUsagePurpose,
};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::CertificateDer;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

const CA_COMMON_NAME: &str = "Reroute Proxy CA";
const CA_ORGANIZATION: &str = "Reroute";

/// Root CA certificate and key
pub struct CertificateAuthority {
    /// The CA certificate as handed to trust stores
    cert_pem: String,
    /// Signing form of the certificate
    cert: Certificate,
    key_pair: KeyPair,
}

impl CertificateAuthority {
    /// Generate a fresh CA
    pub fn generate() -> Result<Self, TlsError> {
        let key_pair =
            KeyPair::generate().map_err(|e| TlsError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(CA_COMMON_NAME.to_string()),
        );
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(CA_ORGANIZATION.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        // Valid for 10 years
        params.not_before = time::OffsetDateTime::now_utc();
        params.not_after =
            time::OffsetDateTime::now_utc() + Duration::from_secs(10 * 365 * 24 * 60 * 60);

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

        info!("Generated new root CA certificate");

        Ok(Self {
            cert_pem: cert.pem(),
            cert,
            key_pair,
        })
    }

    /// Load a CA from PEM files, or create and save one if either is missing
    pub fn load_or_create(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        if cert_path.exists() && key_path.exists() {
            Self::load(cert_path, key_path)
        } else {
            let ca = Self::generate()?;
            ca.save(cert_path, key_path)?;
            Ok(ca)
        }
    }

    /// Load a CA from PEM files
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, TlsError> {
        let cert_pem = fs::read_to_string(cert_path)?;
        let key_pem = fs::read_to_string(key_path)?;

        let key_pair =
            KeyPair::from_pem(&key_pem).map_err(|e| TlsError::PrivateKeyParse(e.to_string()))?;

        // Re-sign the parsed parameters with the stored key to get a signing
        // certificate. Subject and key match the file, so leaves chain to it.
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|e| TlsError::PemParse(e.to_string()))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TlsError::CertificateGeneration(e.to_string()))?;

        info!(path = %cert_path.display(), "Loaded root CA certificate from disk");

        Ok(Self {
            cert_pem,
            cert,
            key_pair,
        })
    }

    /// Save the CA certificate and key to PEM files
    pub fn save(&self, cert_path: &Path, key_path: &Path) -> Result<(), TlsError> {
        if let Some(parent) = cert_path.parent() {
            fs::create_dir_all(parent)?;
        }
        if let Some(parent) = key_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(cert_path, &self.cert_pem)?;
        fs::write(key_path, self.key_pair.serialize_pem())?;

        info!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "Saved root CA certificate and key"
        );

        Ok(())
    }

    /// The CA certificate in PEM format, for installation in trust stores
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// The CA certificate in DER format
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert.der().clone()
    }

    /// Hand the CA to the engine, which signs and caches leaf certificates
    pub fn into_authority(self, cache_size: u64, provider: CryptoProvider) -> RcgenAuthority {
        RcgenAuthority::new(self.key_pair, self.cert, cache_size, provider)
    }
}
