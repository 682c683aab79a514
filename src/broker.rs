/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Broker handshake and control calls
//!
//! The broker listens on a Unix stream socket. Every call is a length
//! prefixed request answered by a length prefixed reply:
//!
//! ```text
//! request: u32 length | u8 method | arguments
//! reply:   u32 length | u32 status | results
//! ```
//!
//! The reply to `CreateConnection` carries the connection descriptor as
//! `SCM_RIGHTS` ancillary data.

use std::io::{self, IoSliceMut, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use tracing::{debug, info, warn};

use crate::config::{BrokerConfig, BusScope};
use crate::error::{Result, TctiError};

/// Directory holding broker sockets on the system bus.
pub const SYSTEM_SOCKET_DIR: &str = "/run/tss2";

const CALL_TIMEOUT: Duration = Duration::from_secs(25);
const MAX_REPLY_LEN: usize = 4096;
const MAX_PASSED_FDS: usize = 8;

/// Calls understood by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BrokerMethod {
    CreateConnection = 1,
    Cancel = 2,
    SetLocality = 3,
}

/// Out-of-band calls addressed to the peer by session id.
pub trait ControlPlane: Send {
    /// Ask the peer to abandon the command it is processing
    fn cancel(&mut self, session_id: u64) -> Result<()>;

    /// Set the locality for subsequent commands
    fn set_locality(&mut self, session_id: u64, locality: u8) -> Result<()>;
}

/// Socket path for `bus_name` on the given bus.
///
/// The session bus lives under `runtime_dir`, normally `$XDG_RUNTIME_DIR`.
pub fn socket_path_in(scope: BusScope, bus_name: &str, runtime_dir: Option<&Path>) -> Result<PathBuf> {
    if bus_name.is_empty() || bus_name.contains('/') {
        return Err(TctiError::BadValue(format!("invalid bus name \"{bus_name}\"")));
    }
    let dir = match scope {
        BusScope::System => PathBuf::from(SYSTEM_SOCKET_DIR),
        BusScope::Session => runtime_dir
            .ok_or_else(|| {
                TctiError::Establishment("XDG_RUNTIME_DIR is not set; no session bus".to_string())
            })?
            .join("tss2"),
    };
    Ok(dir.join(format!("{bus_name}.sock")))
}

/// Socket path the configuration points at.
pub fn socket_path(config: &BrokerConfig) -> Result<PathBuf> {
    if let Some(path) = &config.socket_path {
        return Ok(path.clone());
    }
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR").map(PathBuf::from);
    socket_path_in(config.scope, &config.bus_name, runtime_dir.as_deref())
}

struct Reply {
    status: u32,
    payload: Vec<u8>,
}

/// Connection to the broker.
///
/// A call that fails part way leaves the stream out of step with the
/// broker, so the client drops it and later calls fail with
/// [`TctiError::NoConnection`].
#[derive(Debug)]
pub struct BrokerClient {
    stream: Option<UnixStream>,
    path: PathBuf,
}

impl BrokerClient {
    /// Connect to the broker named by `config`.
    pub fn connect(config: &BrokerConfig) -> Result<Self> {
        let path = socket_path(config)?;
        let stream = UnixStream::connect(&path).map_err(|e| {
            warn!("Failed to reach broker at {}: {}", path.display(), e);
            TctiError::Establishment(format!("broker at {} unreachable: {e}", path.display()))
        })?;
        stream
            .set_read_timeout(Some(CALL_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(CALL_TIMEOUT)))
            .map_err(|e| TctiError::Establishment(e.to_string()))?;
        debug!("connected to broker at {}", path.display());
        Ok(BrokerClient {
            stream: Some(stream),
            path,
        })
    }

    /// Ask the broker for a new connection.
    ///
    /// Returns the passed descriptor and the session id the broker assigned.
    pub fn create_connection(&mut self) -> Result<(UnixStream, u64)> {
        let establishment = |e: TctiError| {
            warn!("Failed to create connection with service: {}", e);
            TctiError::Establishment(format!("CreateConnection failed: {e}"))
        };
        let (reply, mut fds) = self
            .call(BrokerMethod::CreateConnection, &[])
            .map_err(establishment)?;
        TctiError::check_rc(reply.status).map_err(establishment)?;

        let id = reply
            .payload
            .get(..8)
            .and_then(|bytes| bytes.try_into().ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| {
                TctiError::Establishment("CreateConnection reply carries no session id".to_string())
            })?;
        if fds.len() != 1 {
            return Err(TctiError::Establishment(format!(
                "CreateConnection expected to return 1 handle, received {}",
                fds.len()
            )));
        }
        let fd = fds.remove(0);
        info!("broker assigned connection id 0x{:x}", id);
        Ok((UnixStream::from(fd), id))
    }

    fn call(&mut self, method: BrokerMethod, args: &[u8]) -> Result<(Reply, Vec<OwnedFd>)> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(TctiError::NoConnection(format!(
                "connection to broker at {} was dropped after a failed call",
                self.path.display()
            )));
        };
        let mut request = Vec::with_capacity(5 + args.len());
        request.extend_from_slice(&(1 + args.len() as u32).to_be_bytes());
        request.push(method as u8);
        request.extend_from_slice(args);
        debug!(?method, "calling broker");

        let exchanged = Self::exchange(stream, &request);
        let (bytes, fds) = match exchanged {
            Ok(reply) => reply,
            Err(e) => {
                warn!("dropping connection to broker at {}: {}", self.path.display(), e);
                self.stream = None;
                return Err(e);
            }
        };
        let status = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok((
            Reply {
                status,
                payload: bytes[4..].to_vec(),
            },
            fds,
        ))
    }

    fn exchange(mut stream: &UnixStream, request: &[u8]) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        stream.write_all(request)?;
        Self::read_reply(stream)
    }

    /// Read one reply, returning its body (status first) and any passed descriptors.
    fn read_reply(stream: &UnixStream) -> Result<(Vec<u8>, Vec<OwnedFd>)> {
        let mut reply = Vec::new();
        let mut fds = Vec::new();
        let mut chunk = [0u8; 256];

        loop {
            let (n, mut passed) = recv_with_fds(stream, &mut chunk).map_err(|e| match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    TctiError::NoConnection("broker call timed out".to_string())
                }
                _ => TctiError::from(e),
            })?;
            fds.append(&mut passed);
            if n == 0 {
                return Err(TctiError::NoConnection("broker closed the connection".to_string()));
            }
            reply.extend_from_slice(&chunk[..n]);

            if reply.len() < 4 {
                continue;
            }
            let len = u32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]) as usize;
            if !(4..=MAX_REPLY_LEN).contains(&len) {
                return Err(TctiError::GeneralFailure(format!("broker reply length {len} out of range")));
            }
            match reply.len().cmp(&(4 + len)) {
                std::cmp::Ordering::Less => continue,
                std::cmp::Ordering::Equal => break,
                std::cmp::Ordering::Greater => {
                    return Err(TctiError::GeneralFailure(
                        "unexpected bytes after broker reply".to_string(),
                    ))
                }
            }
        }
        reply.drain(..4);
        Ok((reply, fds))
    }
}

impl ControlPlane for BrokerClient {
    fn cancel(&mut self, session_id: u64) -> Result<()> {
        let (reply, _) = self.call(BrokerMethod::Cancel, &session_id.to_be_bytes())?;
        TctiError::check_rc(reply.status).inspect_err(|e| {
            warn!("cancel command failed with error code: 0x{:x}: {}", e.rc(), e);
        })
    }

    fn set_locality(&mut self, session_id: u64, locality: u8) -> Result<()> {
        let mut args = [0u8; 9];
        args[..8].copy_from_slice(&session_id.to_be_bytes());
        args[8] = locality;
        let (reply, _) = self.call(BrokerMethod::SetLocality, &args)?;
        TctiError::check_rc(reply.status).inspect_err(|e| {
            warn!("set locality command failed with error code: 0x{:x}: {}", e.rc(), e);
        })
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// `recvmsg` collecting descriptors passed with `SCM_RIGHTS`.
fn recv_with_fds(stream: &UnixStream, buf: &mut [u8]) -> io::Result<(usize, Vec<OwnedFd>)> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!([RawFd; MAX_PASSED_FDS]);

    loop {
        let msg = match recvmsg::<()>(stream.as_raw_fd(), &mut iov, Some(&mut space), RECV_FLAGS) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        };
        let cmsgs = msg.cmsgs().map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidData, "broker passed more descriptors than expected")
        })?;
        let mut fds = Vec::new();
        for cmsg in cmsgs {
            if let ControlMessageOwned::ScmRights(passed) = cmsg {
                // SAFETY: every descriptor in an SCM_RIGHTS message is newly installed for us.
                fds.extend(passed.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        return Ok((msg.bytes, fds));
    }
}

/// In-process broker used by the tests.
#[cfg(test)]
pub(crate) mod fake {
    use std::io::{IoSlice, Read, Write};
    use std::os::unix::net::UnixListener;
    use std::sync::mpsc;
    use std::thread;

    use nix::sys::socket::{sendmsg, ControlMessage};

    use super::*;

    pub(crate) struct Script {
        pub id: u64,
        pub handles: usize,
        pub create_status: u32,
        pub control_status: u32,
        /// Answer control calls with a reply too short to carry a status.
        pub garbled_control: bool,
    }

    impl Default for Script {
        fn default() -> Self {
            Script {
                id: 0x1234_5678_9ABC_DEF0,
                handles: 1,
                create_status: 0,
                control_status: 0,
                garbled_control: false,
            }
        }
    }

    pub(crate) struct FakeBroker {
        pub path: PathBuf,
        /// Method and arguments of every call, in order.
        pub requests: mpsc::Receiver<(u8, Vec<u8>)>,
        /// Resource manager ends of the connections handed out.
        pub peers: mpsc::Receiver<UnixStream>,
        _dir: tempfile::TempDir,
    }

    impl FakeBroker {
        pub fn config(&self) -> BrokerConfig {
            BrokerConfig::default().with_socket_path(&self.path)
        }
    }

    pub(crate) fn send_with_fds(stream: &UnixStream, data: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let iov = [IoSlice::new(data)];
        let mut cmsgs = Vec::new();
        if !fds.is_empty() {
            cmsgs.push(ControlMessage::ScmRights(fds));
        }
        sendmsg::<()>(stream.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
        Ok(())
    }

    /// Serve one client connection until it hangs up.
    pub(crate) fn spawn(script: Script) -> FakeBroker {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let (request_tx, requests) = mpsc::channel();
        let (peer_tx, peers) = mpsc::channel();

        thread::spawn(move || {
            let Ok((mut conn, _)) = listener.accept() else {
                return;
            };
            loop {
                let mut len = [0u8; 4];
                if conn.read_exact(&mut len).is_err() {
                    return;
                }
                let mut body = vec![0u8; u32::from_be_bytes(len) as usize];
                conn.read_exact(&mut body).unwrap();
                let method = body[0];
                let _ = request_tx.send((method, body[1..].to_vec()));

                if method == BrokerMethod::CreateConnection as u8 {
                    let mut reply = Vec::new();
                    reply.extend_from_slice(&12u32.to_be_bytes());
                    reply.extend_from_slice(&script.create_status.to_be_bytes());
                    reply.extend_from_slice(&script.id.to_be_bytes());

                    let mut passed = Vec::new();
                    for _ in 0..script.handles {
                        let (ours, theirs) = UnixStream::pair().unwrap();
                        let _ = peer_tx.send(ours);
                        passed.push(theirs);
                    }
                    let fds: Vec<RawFd> = passed.iter().map(|s| s.as_raw_fd()).collect();
                    send_with_fds(&conn, &reply, &fds).unwrap();
                } else if script.garbled_control {
                    conn.write_all(&[0, 0, 0, 2, 0, 0]).unwrap();
                } else {
                    let mut reply = Vec::new();
                    reply.extend_from_slice(&4u32.to_be_bytes());
                    reply.extend_from_slice(&script.control_status.to_be_bytes());
                    conn.write_all(&reply).unwrap();
                }
            }
        });

        FakeBroker {
            path,
            requests,
            peers,
            _dir: dir,
        }
    }
}
