/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! TLS client handshake and server certificate policy

use std::net::TcpStream;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::{CertificateError, ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme, StreamOwned};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tracing::{debug, warn};

use crate::config::{ServerVerification, SocketConfig};
use crate::error::{Result, TctiError};

/// A TLS session over a TCP socket.
pub type TlsStream = StreamOwned<ClientConnection, TcpStream>;

/// Short name for why a certificate was rejected.
#[allow(deprecated)]
pub fn rejection_reason(error: &rustls::Error) -> &'static str {
    match error {
        rustls::Error::InvalidCertificate(cert_error) => match cert_error {
            CertificateError::UnknownIssuer => "unknown-ca",
            CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. } => {
                "bad-identity"
            }
            CertificateError::NotValidYet | CertificateError::NotValidYetContext { .. } => "not-activated",
            CertificateError::Expired | CertificateError::ExpiredContext { .. } => "expired",
            CertificateError::Revoked => "revoked",
            CertificateError::BadSignature
            | CertificateError::UnsupportedSignatureAlgorithm
            | CertificateError::UnsupportedSignatureAlgorithmContext { .. }
            | CertificateError::UnsupportedSignatureAlgorithmForPublicKeyContext { .. } => "insecure",
            _ => "invalid",
        },
        _ => "invalid",
    }
}

/// Server certificate verifier applying a [`ServerVerification`] policy.
#[derive(Debug)]
struct PolicyVerifier {
    inner: Option<Arc<WebPkiServerVerifier>>,
    policy: ServerVerification,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let outcome = match &self.inner {
            Some(verifier) => {
                verifier.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
            }
            None => Err(rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer)),
        };
        match (outcome, self.policy) {
            (Ok(verified), _) => Ok(verified),
            (Err(e), ServerVerification::LogAndAccept) => {
                warn!(
                    reason = rejection_reason(&e),
                    "certificate would have been rejected ({}) but accepting anyway", e
                );
                Ok(ServerCertVerified::assertion())
            }
            (Err(e), ServerVerification::Strict) => {
                warn!(reason = rejection_reason(&e), "certificate rejected: {}", e);
                Err(e)
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn establishment(context: &str, path: &Path, e: impl std::fmt::Display) -> TctiError {
    TctiError::Establishment(format!("{context} '{}': {e}", path.display()))
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| establishment("Could not read certificate", path, e))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| establishment("Could not read certificate", path, e))?;
    if certs.is_empty() {
        return Err(establishment("Could not read certificate", path, "no certificates found"));
    }
    Ok(certs)
}

/// Certificate chain and private key stored together in one PEM file.
pub fn load_client_identity(path: &Path) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = load_certificates(path)?;
    let key = PrivateKeyDer::from_pem_file(path).map_err(|e| establishment("Could not read private key", path, e))?;
    Ok((chain, key))
}

fn verifier(config: &SocketConfig, provider: &Arc<CryptoProvider>) -> Result<PolicyVerifier> {
    let inner = match &config.ca_file {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certificates(path)? {
                roots
                    .add(cert)
                    .map_err(|e| establishment("Could not add trust anchor", path, e))?;
            }
            let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
                .build()
                .map_err(|e| establishment("Could not build verifier for", path, e))?;
            Some(verifier)
        }
        None if config.verification == ServerVerification::Strict => {
            return Err(TctiError::BadValue(
                "strict certificate verification needs a CA file".to_string(),
            ));
        }
        None => None,
    };
    Ok(PolicyVerifier {
        inner,
        policy: config.verification,
        algorithms: provider.signature_verification_algorithms,
    })
}

/// Client configuration for `config`.
pub fn client_config(config: &SocketConfig) -> Result<ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = verifier(config, &provider)?;
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| TctiError::Establishment(format!("Could not create TLS connection: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    match &config.cert_file {
        Some(path) => {
            let (chain, key) = load_client_identity(path)?;
            debug!("presenting client certificate from {}", path.display());
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| establishment("Could not use certificate", path, e))
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Name to verify the server against; IPv6 literals may come bracketed.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    let bare = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    ServerName::try_from(bare.to_string())
        .map_err(|e| TctiError::BadValue(format!("invalid server name \"{host}\": {e}")))
}

/// Run the client handshake over a connected, blocking socket.
pub fn handshake(config: &SocketConfig, mut sock: TcpStream) -> Result<TlsStream> {
    let server_name = server_name(&config.host)?;
    let mut conn = ClientConnection::new(Arc::new(client_config(config)?), server_name)
        .map_err(|e| TctiError::Establishment(format!("Could not create TLS connection: {e}")))?;

    while conn.is_handshaking() {
        conn.complete_io(&mut sock)
            .map_err(|e| TctiError::Establishment(format!("Error during TLS handshake: {e}")))?;
    }
    debug!(
        version = ?conn.protocol_version(),
        suite = ?conn.negotiated_cipher_suite().map(|s| s.suite()),
        "TLS handshake complete"
    );
    Ok(StreamOwned::new(conn, sock))
}
