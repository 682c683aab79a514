/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Direct connection to a resource manager over TCP, optionally with TLS

use std::fmt::Display;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::config::SocketConfig;
use crate::error::{Result, TctiError};
use crate::tls;

/// `host:port`, with IPv6 literals in brackets.
pub fn host_and_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Candidate addresses for `host`, in resolver order.
pub fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let target = host_and_port(host, port);
    let addrs: Vec<SocketAddr> = target
        .to_socket_addrs()
        .map_err(|e| TctiError::Establishment(format!("Could not resolve {target}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(TctiError::Establishment(format!("{target} resolved to no addresses")));
    }
    Ok(addrs)
}

/// Try each candidate in order and return the first that connects.
pub fn connect_first<I, T, E, F>(candidates: I, mut connect: F) -> Result<(T, SocketAddr)>
where
    I: IntoIterator<Item = SocketAddr>,
    E: Display,
    F: FnMut(&SocketAddr) -> std::result::Result<T, E>,
{
    let mut attempts = 0;
    for addr in candidates {
        attempts += 1;
        debug!("connecting to {}", addr);
        match connect(&addr) {
            Ok(conn) => return Ok((conn, addr)),
            Err(e) => warn!("Could not connect to {}: {}", addr, e),
        }
    }
    Err(TctiError::Establishment(format!(
        "Could not connect to any of {attempts} addresses"
    )))
}

/// Session id derived from the local end of a connection.
pub fn session_id_for(local: &SocketAddr) -> u64 {
    let digest = Sha256::digest(local.to_string().as_bytes());
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(id)
}

/// Connect to the resource manager named by `config`.
///
/// Returns the established channel, already non-blocking, and its session id.
pub fn connect(config: &SocketConfig) -> Result<(Channel, u64)> {
    if config.host.is_empty() {
        return Err(TctiError::BadValue("host must not be empty".to_string()));
    }
    if config.connect_timeout_ms == 0 {
        return Err(TctiError::BadValue("connect timeout must be positive".to_string()));
    }
    let timeout = config.connect_timeout();
    let (sock, addr) = connect_first(resolve(&config.host, config.port)?, |addr| {
        TcpStream::connect_timeout(addr, timeout)
    })?;
    let establishment = |e: std::io::Error| TctiError::Establishment(format!("{addr}: {e}"));

    let local = sock.local_addr().map_err(establishment)?;
    let session_id = session_id_for(&local);
    info!("connected to {} from {}, session id 0x{:x}", addr, local, session_id);
    sock.set_nodelay(true).map_err(establishment)?;

    let channel = if config.tls {
        sock.set_read_timeout(Some(timeout)).map_err(establishment)?;
        let stream = tls::handshake(config, sock)?;
        stream.sock.set_read_timeout(None).map_err(establishment)?;
        stream.sock.set_nonblocking(true).map_err(establishment)?;
        Channel::Tls(Box::new(stream))
    } else {
        sock.set_nonblocking(true).map_err(establishment)?;
        Channel::Socket(sock)
    };
    Ok((channel, session_id))
}
