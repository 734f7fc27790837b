//! TLS plumbing for Reroute Proxy
//!
//! This module provides:
//! - The root Certificate Authority used to sign per-host certificates
//! - The upstream connector whose certificate checks go through the trust policy
//!
//! Which tunnels get decrypted at all is decided by the redirect policy; hosts
//! outside the intercepted domain set are tunneled through untouched.

pub mod ca;
pub mod verifier;

pub use ca::CertificateAuthority;
pub use verifier::{classify_error, UpstreamCertVerifier};

use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use rustls::crypto::CryptoProvider;
use rustls::ClientConfig;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while setting up TLS
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to generate key pair: {0}")]
    KeyGeneration(String),

    #[error("Failed to generate certificate: {0}")]
    CertificateGeneration(String),

    #[error("Failed to read or write file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("Failed to parse PEM: {0}")]
    PemParse(String),

    #[error("Failed to parse private key: {0}")]
    PrivateKeyParse(String),

    #[error("Failed to build certificate verifier: {0}")]
    Verifier(String),

    #[error("Rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

/// Build the connector the engine uses to reach upstream servers.
///
/// Plain `http://` targets (the redirect gateway) are allowed alongside
/// `https://` upstreams, whose certificates go through [`UpstreamCertVerifier`].
pub fn upstream_connector(
    provider: Arc<CryptoProvider>,
) -> Result<HttpsConnector<HttpConnector>, TlsError> {
    let verifier = UpstreamCertVerifier::with_webpki_roots(provider.clone())?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();

    Ok(HttpsConnectorBuilder::new()
        .with_tls_config(config)
        .https_or_http()
        .enable_http1()
        .build())
}
