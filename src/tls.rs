//! TLS plumbing shared by the MITM acceptor and the upstream connector.

use std::sync::Arc;

use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{
  ring, verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
  ClientConfig, DigitallySignedStruct, Error as TLSError, ServerConfig, SignatureScheme,
};

use crate::certs::TlsIdentity;
use crate::errors::{Error, Result};

/// Client config that accepts any upstream certificate chain. The proxy
/// terminates trust at itself; upstream validation is intentionally skipped.
pub(crate) fn insecure_client_config() -> Arc<ClientConfig> {
  let config = ClientConfig::builder()
    .dangerous()
    .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
    .with_no_client_auth();
  Arc::new(config)
}

/// Server config presenting a minted leaf identity to the hijacked client.
pub(crate) fn server_config(identity: TlsIdentity) -> Result<ServerConfig> {
  ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(identity.chain, identity.key)
    .map_err(|e| Error::certificate(format!("failed to build TLS server config: {e}")))
}

/// Verifier that waves the chain through but still checks the handshake
/// signatures with the provider's algorithms, so a broken peer fails the
/// handshake rather than the first read.
#[derive(Debug)]
pub(crate) struct AcceptAnyServerCert {
  algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
  pub(crate) fn new() -> Self {
    Self {
      algorithms: ring::default_provider().signature_verification_algorithms,
    }
  }
}

impl ServerCertVerifier for AcceptAnyServerCert {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, TLSError> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    verify_tls12_signature(message, cert, dss, &self.algorithms)
  }

  fn verify_tls13_signature(
    &self,
    message: &[u8],
    cert: &CertificateDer,
    dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, TLSError> {
    verify_tls13_signature(message, cert, dss, &self.algorithms)
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.algorithms.supported_schemes()
  }
}
