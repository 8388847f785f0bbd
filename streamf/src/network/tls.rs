// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! rustls configuration for secure dialers and listeners

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use super::NetworkError;
use crate::common::WrappedStream;
use crate::dialer::DialError;
use crate::util::Context;

pub const DEFAULT_ALPN: &[&str] = &["h2", "http/1.1"];

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
  Arc::new(rustls::crypto::ring::default_provider())
}

/// Client-side TLS layered over a transport after it has been handed off
#[derive(Clone)]
pub struct TlsClient {
  connector: TlsConnector,
  server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsClient {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsClient")
      .field("server_name", &self.server_name)
      .finish()
  }
}

impl TlsClient {
  pub fn new(server_name: &str, allow_insecure: bool, alpn: &[String]) -> Result<Self, NetworkError> {
    let server_name = ServerName::try_from(server_name.to_string())
      .map_err(|_| NetworkError::InvalidServerName(server_name.to_string()))?;
    let config = client_config(allow_insecure, alpn)?;
    Ok(Self {
      connector: TlsConnector::from(config),
      server_name,
    })
  }

  /// Runs the client handshake, racing `ctx`
  ///
  /// The raw transport is dropped, and thereby closed, when the handshake fails or loses.
  pub async fn handshake(&self, ctx: &Context, stream: WrappedStream) -> Result<WrappedStream, DialError> {
    let handshake = self.connector.connect(self.server_name.clone(), stream);
    tokio::select! {
      biased;
      e = ctx.done() => Err(e.into()),
      res = handshake => res
        .map(|secured| WrappedStream::TlsClient(Box::new(secured)))
        .map_err(DialError::Tls),
    }
  }
}

pub fn client_config(allow_insecure: bool, alpn: &[String]) -> Result<Arc<ClientConfig>, NetworkError> {
  let builder = ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;
  let mut config = if allow_insecure {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
      .with_no_client_auth()
  } else {
    builder
      .with_root_certificates(native_roots())
      .with_no_client_auth()
  };
  config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
  Ok(Arc::new(config))
}

fn native_roots() -> RootCertStore {
  let mut roots = RootCertStore::empty();
  match rustls_native_certs::load_native_certs() {
    Ok(certs) => {
      let (added, ignored) = roots.add_parsable_certificates(certs);
      tracing::trace!(added, ignored, "loaded native root certificates");
    }
    Err(error) => tracing::warn!(%error, "failed to load native root certificates"),
  }
  roots
}

pub fn server_config(
  certs: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  alpn: &[String],
) -> Result<Arc<ServerConfig>, NetworkError> {
  let mut config = ServerConfig::builder_with_provider(provider())
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
  config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
  Ok(Arc::new(config))
}

/// Reads a PEM certificate chain and private key from disk
pub fn load_server_config(
  cert_file: impl AsRef<Path>,
  key_file: impl AsRef<Path>,
  alpn: &[String],
) -> Result<Arc<ServerConfig>, NetworkError> {
  let certs = load_certs(cert_file)?;
  let key = load_private_key(key_file)?;
  server_config(certs, key, alpn)
}

pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
  let mut reader = BufReader::new(File::open(path.as_ref())?);
  read_certs(&mut reader, &path.as_ref().display().to_string())
}

pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, NetworkError> {
  let mut reader = BufReader::new(File::open(path.as_ref())?);
  read_private_key(&mut reader, &path.as_ref().display().to_string())
}

/// Builds a server configuration from in-memory PEM text
pub fn parse_server_config(
  cert_pem: &str,
  key_pem: &str,
  alpn: &[String],
) -> Result<Arc<ServerConfig>, NetworkError> {
  let certs = read_certs(&mut cert_pem.as_bytes(), "inline certificate")?;
  let key = read_private_key(&mut key_pem.as_bytes(), "inline key")?;
  server_config(certs, key, alpn)
}

fn read_certs(
  reader: &mut dyn std::io::BufRead,
  origin: &str,
) -> Result<Vec<CertificateDer<'static>>, NetworkError> {
  let certs = rustls_pemfile::certs(reader).collect::<Result<Vec<_>, _>>()?;
  if certs.is_empty() {
    return Err(NetworkError::InvalidCertificate(origin.to_string()));
  }
  Ok(certs)
}

fn read_private_key(
  reader: &mut dyn std::io::BufRead,
  origin: &str,
) -> Result<PrivateKeyDer<'static>, NetworkError> {
  rustls_pemfile::private_key(reader)?
    .ok_or_else(|| NetworkError::InvalidCertificate(origin.to_string()))
}

pub(crate) fn acceptor(config: Arc<ServerConfig>) -> TlsAcceptor {
  TlsAcceptor::from(config)
}

/// Accepts any server certificate; only used when a dialer sets `allowInsecure`
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
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
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &DigitallySignedStruct,
  ) -> Result<HandshakeSignatureValid, rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    provider()
      .signature_verification_algorithms
      .supported_schemes()
  }
}

#[cfg(test)]
mod tests {
  use super::{client_config, TlsClient};
  use crate::network::NetworkError;

  #[test]
  fn insecure_client_carries_alpn() {
    let config = client_config(true, &["h2".to_string()]).unwrap();
    assert_eq!(config.alpn_protocols, vec![b"h2".to_vec()]);
  }

  #[test]
  fn rejects_unusable_server_names() {
    assert!(matches!(
      TlsClient::new("", true, &[]),
      Err(NetworkError::InvalidServerName(_))
    ));
    assert!(TlsClient::new("example.com", true, &[]).is_ok());
  }

  #[test]
  fn inline_pem_without_blocks_is_rejected() {
    assert!(matches!(
      super::parse_server_config("not a certificate", "not a key", &[]),
      Err(NetworkError::InvalidCertificate(origin)) if origin == "inline certificate"
    ));
  }
}
