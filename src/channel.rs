/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Duplex channels carrying TPM command and response frames

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;

use crate::poll::{self, Readiness};
use crate::tls::TlsStream;

/// Main trait for channels a context can drive
pub trait Duplex: Read + Write + AsFd {
    /// Descriptor callers poll on
    fn poll_handle(&self) -> RawFd {
        self.as_fd().as_raw_fd()
    }

    /// Wait until a read would make progress
    fn wait_readable(&mut self, timeout_ms: i32) -> io::Result<Readiness> {
        poll::wait_readable(self.as_fd(), timeout_ms)
    }

    /// Close the connection to the peer
    fn close(&mut self) -> io::Result<()>;
}

/// The channel kinds a connection can be established over.
pub enum Channel {
    /// Descriptor passed by the broker
    Descriptor(UnixStream),
    /// Plain TCP socket
    Socket(TcpStream),
    /// TLS session over a TCP socket
    Tls(Box<TlsStream>),
}

impl Channel {
    fn kind(&self) -> &'static str {
        match self {
            Channel::Descriptor(_) => "descriptor",
            Channel::Socket(_) => "socket",
            Channel::Tls(_) => "tls",
        }
    }
}

fn ignore_not_connected(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
        other => other,
    }
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Channel::Descriptor(stream) => stream.read(buf),
            Channel::Socket(stream) => stream.read(buf),
            Channel::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Channel::Descriptor(stream) => stream.write(buf),
            Channel::Socket(stream) => stream.write(buf),
            Channel::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Channel::Descriptor(stream) => stream.flush(),
            Channel::Socket(stream) => stream.flush(),
            Channel::Tls(stream) => stream.flush(),
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Channel::Descriptor(stream) => stream.as_fd(),
            Channel::Socket(stream) => stream.as_fd(),
            Channel::Tls(stream) => stream.sock.as_fd(),
        }
    }
}

impl Duplex for Channel {

    fn wait_readable(&mut self, timeout_ms: i32) -> io::Result<Readiness> {
        if let Channel::Tls(stream) = self {
            // Decrypted bytes already buffered never show up on the socket.
            let state = stream
                .conn
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            if state.plaintext_bytes_to_read() > 0 || state.peer_has_closed() {
                return Ok(Readiness::Ready);
            }
        }
        poll::wait_readable(self.as_fd(), timeout_ms)
    }

    fn close(&mut self) -> io::Result<()> {
        match self {
            Channel::Descriptor(stream) => ignore_not_connected(stream.shutdown(Shutdown::Both)),
            Channel::Socket(stream) => ignore_not_connected(stream.shutdown(Shutdown::Both)),
            Channel::Tls(stream) => {
                let stream = &mut **stream;
                stream.conn.send_close_notify();
                // Best effort on a non-blocking socket; the peer may already be gone.
                let _ = stream.conn.complete_io(&mut stream.sock);
                ignore_not_connected(stream.sock.shutdown(Shutdown::Both))
            }
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind())
            .field("fd", &self.poll_handle())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_round_trip() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut channel = Channel::Descriptor(a);

        assert_eq!(channel.wait_readable(0).unwrap(), Readiness::TimedOut);
        b.write_all(b"frame").unwrap();
        assert_eq!(channel.wait_readable(100).unwrap(), Readiness::Ready);

        let mut buf = [0u8; 8];
        assert_eq!(channel.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"frame");

        channel.write_all(b"reply").unwrap();
        let mut echo = [0u8; 5];
        b.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"reply");
    }

    #[test]
    fn test_poll_handle_is_stream_descriptor() {
        let (a, _b) = UnixStream::pair().unwrap();
        let fd = a.as_raw_fd();
        let channel = Channel::Descriptor(a);
        assert_eq!(channel.poll_handle(), fd);
        assert_eq!(channel.as_fd().as_raw_fd(), fd);
    }

    #[test]
    fn test_close_twice() {
        let (a, _b) = UnixStream::pair().unwrap();
        let mut channel = Channel::Descriptor(a);
        channel.close().unwrap();
        channel.close().unwrap();
    }

    #[test]
    fn test_debug_names_kind() {
        let (a, _b) = UnixStream::pair().unwrap();
        let channel = Channel::Descriptor(a);
        assert!(format!("{:?}", channel).contains("descriptor"));
    }
}
