//! rustls client configuration for the two TLS trust modes.
use super::{TransportError, TrustMode};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// gRPC requires HTTP/2.
const ALPN_H2: &[u8] = b"h2";

pub(super) fn connector(mode: TrustMode) -> Result<TlsConnector, TransportError> {
    Ok(TlsConnector::from(Arc::new(client_config(mode)?)))
}

pub(super) fn server_name(host: &str) -> Result<ServerName<'static>, TransportError> {
    ServerName::try_from(host.to_string()).map_err(|e| TransportError::InvalidHost {
        host: host.to_string(),
        reason: e.to_string(),
    })
}

fn client_config(mode: TrustMode) -> Result<ClientConfig, TransportError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(TransportError::TlsConfig)?;

    let mut config = match mode {
        TrustMode::TrustAll => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
            .with_no_client_auth(),
        TrustMode::System | TrustMode::Plaintext => builder
            .with_root_certificates(native_roots()?)
            .with_no_client_auth(),
    };

    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}

fn native_roots() -> Result<RootCertStore, TransportError> {
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        // Some certificates may still have loaded.
        tracing::debug!("errors loading native certs: {:?}", native.errors);
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    tracing::debug!(added, ignored, "loaded native root certificates");

    if roots.is_empty() {
        return Err(TransportError::NoTrustRoots);
    }
    Ok(roots)
}

/// Certificate verifier that accepts any server certificate.
///
/// Handshake signatures are still checked, so the session is bound to the key of whatever
/// certificate was presented; only the chain of trust is skipped.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
