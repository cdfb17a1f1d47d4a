//! Certificate expiry and issuer lookup for HTTPS targets.
//!
//! The handshake accepts any certificate so that expiry can be reported for
//! untrusted chains too; whether the chain verified against the native roots
//! is reported separately.

use chrono::{DateTime, Utc};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::db::models::TlsInfo;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS handshake timed out")]
    Timeout,
    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),
    #[error("Invalid server name: {0}")]
    InvalidName(String),
    #[error("Server presented no certificate")]
    NoCertificate,
    #[error("Failed to parse certificate: {0}")]
    Parse(String),
}

/// Certificate facts read from one handshake.
#[derive(Debug, Clone)]
pub struct CertificateReport {
    pub info: TlsInfo,
    pub trusted: bool,
}

impl CertificateReport {
    /// Fields merged into a check record's metadata.
    pub fn metadata(&self, now: DateTime<Utc>) -> serde_json::Map<String, serde_json::Value> {
        let mut map = serde_json::Map::new();
        map.insert("ssl_expires_at".into(), self.info.expires_at.to_rfc3339().into());
        map.insert("ssl_issuer".into(), self.info.issuer.clone().into());
        map.insert("ssl_days_remaining".into(), self.info.days_remaining(now).into());
        map.insert("ssl_trusted".into(), self.trusted.into());
        map
    }
}

/// Reads peer certificates. Built once; the native root store is loaded on construction.
pub struct CertificateInspector {
    provider: Arc<CryptoProvider>,
    webpki: Option<Arc<WebPkiServerVerifier>>,
}

impl Default for CertificateInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl CertificateInspector {
    pub fn new() -> Self {
        let provider = Arc::new(rustls::crypto::ring::default_provider());

        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for error in &native.errors {
            debug!(error = %error, "Skipping unreadable native certificate.");
        }
        let (added, _ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, "Loaded native root certificates.");

        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| warn!(error = %e, "No usable root store; certificates will be reported as untrusted."))
            .ok();

        Self { provider, webpki }
    }

    pub async fn inspect(&self, host: &str, port: u16, timeout: Duration) -> Result<CertificateReport, TlsError> {
        let trusted = Arc::new(AtomicBool::new(false));
        let verifier = RecordingVerifier {
            inner: self.webpki.clone(),
            provider: self.provider.clone(),
            trusted: trusted.clone(),
        };
        let config = ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        let server_name =
            ServerName::try_from(host.to_string()).map_err(|e| TlsError::InvalidName(e.to_string()))?;
        let connector = TlsConnector::from(Arc::new(config));

        let handshake = async {
            let stream = TcpStream::connect((host, port)).await?;
            connector.connect(server_name, stream).await
        };
        let tls_stream = tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| TlsError::Timeout)??;

        let (_, connection) = tls_stream.get_ref();
        let leaf = connection
            .peer_certificates()
            .and_then(|certs| certs.first())
            .ok_or(TlsError::NoCertificate)?;
        let info = parse_leaf(leaf.as_ref(), Utc::now())?;

        Ok(CertificateReport {
            info,
            trusted: trusted.load(Ordering::SeqCst),
        })
    }
}

fn parse_leaf(der: &[u8], checked_at: DateTime<Utc>) -> Result<TlsInfo, TlsError> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| TlsError::Parse(e.to_string()))?;
    let expires_at = DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| TlsError::Parse("not_after out of range".to_string()))?;
    Ok(TlsInfo {
        expires_at,
        issuer: cert.issuer().to_string(),
        checked_at,
    })
}

/// Accepts every certificate and records whether WebPKI would have.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
    trusted: Arc<AtomicBool>,
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let verified = self
            .inner
            .as_ref()
            .map(|v| {
                v.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                    .is_ok()
            })
            .unwrap_or(false);
        self.trusted.store(verified, Ordering::SeqCst);
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
