//! Upstream certificate verification
//!
//! Intercepted tunnels are re-encrypted towards the real server. The engine's
//! upstream client uses [`UpstreamCertVerifier`], which runs the standard
//! WebPKI checks, reduces any failure to a [`CertPolicyErrors`] set and lets
//! the trust policy decide.

use super::TlsError;
use reroute_core::{validate_upstream_certificate, CertPolicyError, CertPolicyErrors};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tracing::{debug, warn};

/// Classify a rustls verification failure into policy errors
pub fn classify_error(err: &rustls::Error) -> CertPolicyErrors {
    let error = match err {
        rustls::Error::NoCertificatesPresented => CertPolicyError::RemoteCertificateNotAvailable,
        rustls::Error::InvalidCertificate(
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
        ) => CertPolicyError::RemoteCertificateNameMismatch,
        _ => CertPolicyError::RemoteCertificateChainErrors,
    };
    error.into()
}

/// Server certificate verifier that defers the trust decision to the policy
#[derive(Debug)]
pub struct UpstreamCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl UpstreamCertVerifier {
    /// Verifier trusting the Mozilla root set shipped in `webpki-roots`
    pub fn with_webpki_roots(provider: Arc<CryptoProvider>) -> Result<Self, TlsError> {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Self::with_roots(roots, provider)
    }

    pub fn with_roots(
        roots: RootCertStore,
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, TlsError> {
        let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
            .build()
            .map_err(|e| TlsError::Verifier(e.to_string()))?;
        Ok(Self { inner })
    }
}

impl ServerCertVerifier for UpstreamCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let result = self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        );

        let errors = match &result {
            Ok(_) => CertPolicyErrors::none(),
            Err(e) => classify_error(e),
        };

        if validate_upstream_certificate(&errors) {
            debug!(server = ?server_name, "Upstream certificate trusted");
            return Ok(ServerCertVerified::assertion());
        }

        warn!(
            server = ?server_name,
            errors = %errors,
            "Rejecting upstream certificate"
        );
        result
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
