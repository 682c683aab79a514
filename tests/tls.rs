/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rcgen::{BasicConstraints, Certificate, CertificateParams, ExtendedKeyUsagePurpose, IsCa, KeyPair};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, ServerConnection, StreamOwned, SupportedProtocolVersion};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tempfile::TempDir;
use tss_tcti_rm::{ResponseHeader, ServerVerification, SocketConfig, TctiContext, TctiError, TIMEOUT_BLOCK};

struct Authority {
    cert: Certificate,
    key: KeyPair,
}

impl Authority {
    fn new() -> Self {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Authority { cert, key }
    }

    /// Leaf certificate for `localhost` and its key.
    fn issue(&self) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der()));
        (cert.der().clone(), key)
    }

    fn write_pem(&self, dir: &TempDir) -> PathBuf {
        let path = dir.path().join("ca.pem");
        std::fs::write(&path, self.cert.pem()).unwrap();
        path
    }

    /// Client certificate chain and key for `name`, written to one PEM file.
    fn write_client_identity(&self, dir: &TempDir, name: &str) -> PathBuf {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![name.to_string()]).unwrap();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();
        let path = dir.path().join(format!("{name}.pem"));
        std::fs::write(&path, format!("{}{}", cert.pem(), key.serialize_pem())).unwrap();
        path
    }
}

/// Server configuration presenting a leaf from `authority`.
///
/// With `client_ca` the server demands a client certificate issued by it.
fn server_config(
    authority: &Authority,
    client_ca: Option<&Authority>,
    versions: &[&'static SupportedProtocolVersion],
) -> ServerConfig {
    let (cert, key) = authority.issue();
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(versions)
        .unwrap();
    let builder = match client_ca {
        Some(ca) => {
            let mut roots = RootCertStore::empty();
            roots.add(ca.cert.der().clone()).unwrap();
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    builder.with_single_cert(vec![cert], key).unwrap()
}

fn serve(authority: &Authority) -> (u16, JoinHandle<Option<Vec<u8>>>) {
    serve_config(server_config(authority, None, rustls::DEFAULT_VERSIONS), Duration::ZERO)
}

/// Serve one connection: read a 12-byte command and, after `delay`, answer
/// with a 10-byte frame.
fn serve_config(config: ServerConfig, delay: Duration) -> (u16, JoinHandle<Option<Vec<u8>>>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (sock, _) = listener.accept().ok()?;
        let conn = ServerConnection::new(Arc::new(config)).ok()?;
        let mut stream = StreamOwned::new(conn, sock);
        let mut command = vec![0u8; 12];
        stream.read_exact(&mut command).ok()?;
        thread::sleep(delay);
        stream.write_all(&ResponseHeader::new(0x8001, 10, 0).to_bytes()).ok()?;
        stream.flush().ok()?;
        // hold the session open until the client closes it
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        Some(command)
    });
    (port, handle)
}

const GET_RANDOM: [u8; 12] = [0x80, 0x01, 0, 0, 0, 12, 0, 0, 1, 0x7B, 0, 8];

fn round_trip(ctx: &mut TctiContext) -> usize {
    ctx.transmit(&GET_RANDOM).unwrap();
    let mut buf = [0u8; 10];
    ctx.receive(Some(&mut buf), TIMEOUT_BLOCK).unwrap()
}

#[test]
fn test_log_and_accept_untrusted_server() {
    let authority = Authority::new();
    let (port, server) = serve(&authority);

    let config = SocketConfig::new("127.0.0.1", port).with_tls(ServerVerification::LogAndAccept);
    let mut ctx = TctiContext::connect_socket(&config).unwrap();
    assert_eq!(round_trip(&mut ctx), 10);
    ctx.finalize();

    assert_eq!(server.join().unwrap().unwrap()[9], 0x7B);
}

#[test]
fn test_strict_with_trusted_authority() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Authority::new();
    let (port, server) = serve(&authority);

    let mut config = SocketConfig::new("localhost", port).with_tls(ServerVerification::Strict);
    config.ca_file = Some(authority.write_pem(&dir));
    let mut ctx = TctiContext::connect_socket(&config).unwrap();
    assert_eq!(round_trip(&mut ctx), 10);
    drop(ctx);

    assert!(server.join().unwrap().is_some());
}

#[test]
fn test_strict_rejects_unknown_authority() {
    let dir = tempfile::tempdir().unwrap();
    let (port, server) = serve(&Authority::new());

    let mut config = SocketConfig::new("127.0.0.1", port).with_tls(ServerVerification::Strict);
    config.ca_file = Some(Authority::new().write_pem(&dir));
    let err = TctiContext::connect_socket(&config).unwrap_err();
    assert!(matches!(err, TctiError::Establishment(_)), "{err}");

    assert!(server.join().unwrap().is_none());
}

#[test]
fn test_blocking_receive_waits_for_late_reply() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Authority::new();
    let config = server_config(&authority, None, rustls::DEFAULT_VERSIONS);
    let (port, server) = serve_config(config, Duration::from_millis(200));

    let mut config = SocketConfig::new("localhost", port).with_tls(ServerVerification::Strict);
    config.ca_file = Some(authority.write_pem(&dir));
    let mut ctx = TctiContext::connect_socket(&config).unwrap();

    // session tickets arrive well before the response
    ctx.transmit(&GET_RANDOM).unwrap();
    let size = ctx.receive(None, TIMEOUT_BLOCK).unwrap();
    assert_eq!(size, 10);
    let mut buf = vec![0u8; size];
    assert_eq!(ctx.receive(Some(&mut buf), TIMEOUT_BLOCK).unwrap(), 10);
    assert_eq!(ResponseHeader::from_slice(&buf).unwrap().code, 0);
    ctx.finalize();

    assert!(server.join().unwrap().is_some());
}

#[test]
fn test_client_certificate_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Authority::new();
    let clients = Authority::new();
    let config = server_config(&authority, Some(&clients), rustls::DEFAULT_VERSIONS);
    let (port, server) = serve_config(config, Duration::ZERO);

    let mut config = SocketConfig::new("localhost", port).with_tls(ServerVerification::Strict);
    config.ca_file = Some(authority.write_pem(&dir));
    config.cert_file = Some(clients.write_client_identity(&dir, "client"));
    let mut ctx = TctiContext::connect_socket(&config).unwrap();
    assert_eq!(round_trip(&mut ctx), 10);
    ctx.finalize();

    assert_eq!(server.join().unwrap().unwrap(), GET_RANDOM);
}

#[test]
fn test_missing_client_certificate_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let authority = Authority::new();
    let clients = Authority::new();
    // under TLS 1.2 the server's verdict on the client arrives before the handshake ends
    let config = server_config(&authority, Some(&clients), &[&rustls::version::TLS12]);
    let (port, server) = serve_config(config, Duration::ZERO);

    let mut config = SocketConfig::new("localhost", port).with_tls(ServerVerification::Strict);
    config.ca_file = Some(authority.write_pem(&dir));
    let err = TctiContext::connect_socket(&config).unwrap_err();
    assert!(matches!(err, TctiError::Establishment(_)), "{err}");

    assert!(server.join().unwrap().is_none());
}
