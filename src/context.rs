/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Framed transport state machine

use std::fmt;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, ControlPlane};
use crate::channel::{Channel, Duplex};
use crate::config::{BrokerConfig, SocketConfig, TctiConfig};
use crate::error::{Result, TctiError};
use crate::header::{ResponseHeader, TPM_HEADER_SIZE};
use crate::io::{self, Progress};
use crate::poll::Readiness;
use crate::socket;

/// Block until the response arrives.
pub const TIMEOUT_BLOCK: i32 = -1;

/// Return immediately if nothing is available.
pub const TIMEOUT_NONE: i32 = 0;

/// Where a context is in the command/response cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Ready for a command
    Transmit,
    /// Command sent; response not yet delivered
    Receive,
    /// Finalized
    Final,
}

/// One connection to a resource manager.
///
/// A context carries one command/response cycle at a time: [`transmit`]
/// a command, then call [`receive`] until the whole response is delivered.
/// Dropping the context closes the connection.
///
/// [`transmit`]: TctiContext::transmit
/// [`receive`]: TctiContext::receive
pub struct TctiContext<C: Duplex = Channel> {
    state: State,
    channel: Option<C>,
    control: Option<Box<dyn ControlPlane>>,
    session_id: u64,
    /// Bytes of the current response read so far
    index: usize,
    frame: Vec<u8>,
    header: Option<ResponseHeader>,
}

/// Poll allowance for one receive call.
struct Wait {
    timeout_ms: i32,
    deadline: Option<Instant>,
    polled: bool,
}

impl Wait {
    fn new(timeout_ms: i32) -> Self {
        let deadline = u64::try_from(timeout_ms)
            .ok()
            .filter(|ms| *ms > 0)
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        Wait {
            timeout_ms,
            deadline,
            polled: false,
        }
    }

    /// Timeout for the next poll, shrinking toward the deadline.
    fn remaining_ms(&self) -> i32 {
        match self.deadline {
            Some(deadline) => {
                let left = deadline.saturating_duration_since(Instant::now()).as_millis();
                i32::try_from(left).unwrap_or(i32::MAX)
            }
            None => self.timeout_ms,
        }
    }
}

impl TctiContext<Channel> {
    /// Ask the broker for a connection.
    pub fn connect_broker(config: &BrokerConfig) -> Result<Self> {
        if config.bus_name.is_empty() {
            return Err(TctiError::BadValue("bus name must not be empty".to_string()));
        }
        let mut broker = BrokerClient::connect(config)?;
        let (stream, session_id) = broker.create_connection()?;
        stream.set_nonblocking(true).map_err(|e| {
            TctiError::Establishment(format!("Could not make connection non-blocking: {e}"))
        })?;
        Ok(TctiContext::new(Channel::Descriptor(stream), session_id).with_control_plane(Box::new(broker)))
    }

    /// Connect directly to the resource manager, with TLS if configured.
    pub fn connect_socket(config: &SocketConfig) -> Result<Self> {
        let (channel, session_id) = socket::connect(config)?;
        Ok(TctiContext::new(channel, session_id))
    }

    pub fn connect(config: &TctiConfig) -> Result<Self> {
        match config {
            TctiConfig::Broker(broker) => Self::connect_broker(broker),
            TctiConfig::Socket(socket) => Self::connect_socket(socket),
        }
    }
}

impl<C: Duplex> TctiContext<C> {
    /// Wrap an established, non-blocking channel.
    pub fn new(channel: C, session_id: u64) -> Self {
        TctiContext {
            state: State::Transmit,
            channel: Some(channel),
            control: None,
            session_id,
            index: 0,
            frame: vec![0; TPM_HEADER_SIZE],
            header: None,
        }
    }

    /// Route [`cancel`](Self::cancel) and [`set_locality`](Self::set_locality) through `control`.
    pub fn with_control_plane(mut self, control: Box<dyn ControlPlane>) -> Self {
        self.control = Some(control);
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Header of the response being received, once it is complete.
    pub fn response_header(&self) -> Option<ResponseHeader> {
        self.header
    }

    /// Descriptor to wait on for response data.
    pub fn poll_handle(&self) -> Result<RawFd> {
        self.channel
            .as_ref()
            .map(Duplex::poll_handle)
            .ok_or_else(|| TctiError::NoConnection("context is finalized".to_string()))
    }

    fn expect_state(&self, expected: State) -> Result<()> {
        if self.state != expected {
            debug!("{:?} requested in {:?} state", expected, self.state);
            return Err(TctiError::BadSequence(self.state));
        }
        Ok(())
    }

    fn channel(&mut self) -> Result<&mut C> {
        self.channel
            .as_mut()
            .ok_or_else(|| TctiError::NoConnection("context is finalized".to_string()))
    }

    /// Send a command to the resource manager.
    pub fn transmit(&mut self, command: &[u8]) -> Result<()> {
        self.expect_state(State::Transmit)?;
        if command.is_empty() {
            return Err(TctiError::BadValue("command is empty".to_string()));
        }
        debug!(session_id = self.session_id, "transmitting {} bytes", command.len());

        let channel = self.channel()?;
        match io::write_all(channel, command) {
            Ok(n) if n == command.len() => {
                self.state = State::Receive;
                Ok(())
            }
            Ok(0) => {
                debug!("peer accepted no data");
                Err(TctiError::NoConnection("peer stopped accepting data".to_string()))
            }
            Ok(n) => {
                debug!("short write");
                Err(TctiError::GeneralFailure(format!(
                    "wrote {} of {} bytes",
                    n,
                    command.len()
                )))
            }
            Err(e) => {
                debug!("error writing command: {}", e);
                Err(TctiError::Io(e))
            }
        }
    }

    /// Read the first `len` bytes of the response into the frame buffer.
    ///
    /// Polls only when bytes are still missing. A wakeup that yields no
    /// response bytes polls again while `wait` has time left; any other
    /// shortfall returns [`TctiError::TryAgain`].
    fn fill(&mut self, len: usize, wait: &mut Wait) -> Result<()> {
        if self.index >= len {
            return Ok(());
        }
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| TctiError::NoConnection("context is finalized".to_string()))?;
        loop {
            if !wait.polled {
                wait.polled = true;
                if channel.wait_readable(wait.remaining_ms())? == Readiness::TimedOut {
                    debug!("poll timed out after {} milliseconds", wait.timeout_ms);
                    return Err(TctiError::TryAgain);
                }
            }
            let before = self.index;
            match io::read_into(channel, &mut self.frame[..len], &mut self.index)? {
                Progress::Complete => return Ok(()),
                Progress::Pending if self.index == before && wait.timeout_ms != TIMEOUT_NONE => {
                    debug!("woken with no response bytes; polling again");
                    wait.polled = false;
                }
                Progress::Pending => return Err(TctiError::TryAgain),
            }
        }
    }

    fn reset(&mut self) {
        self.index = 0;
        self.header = None;
        self.frame.truncate(TPM_HEADER_SIZE);
        self.state = State::Transmit;
    }

    /// Receive the response to the last command.
    ///
    /// With no buffer this is a size query: it reads only as far as the
    /// header and returns the total response size. With a buffer it returns
    /// the number of bytes delivered once the whole response is in. Until
    /// then it returns [`TctiError::TryAgain`] and the next call picks up
    /// where this one left off.
    pub fn receive(&mut self, response: Option<&mut [u8]>, timeout_ms: i32) -> Result<usize> {
        debug!(session_id = self.session_id, "receive");
        self.expect_state(State::Receive)?;
        if timeout_ms < TIMEOUT_BLOCK {
            return Err(TctiError::BadValue(format!("timeout {timeout_ms} is out of range")));
        }
        if let Some(buf) = &response {
            if buf.len() < TPM_HEADER_SIZE {
                return Err(TctiError::InsufficientBuffer {
                    needed: TPM_HEADER_SIZE,
                    capacity: buf.len(),
                });
            }
        }

        let mut wait = Wait::new(timeout_ms);
        let header = match self.header {
            Some(header) => header,
            None => {
                self.fill(TPM_HEADER_SIZE, &mut wait)?;
                let mut bytes = [0u8; TPM_HEADER_SIZE];
                bytes.copy_from_slice(&self.frame[..TPM_HEADER_SIZE]);
                let header = ResponseHeader::parse(&bytes);
                if !header.is_well_formed() {
                    warn!("response header declares {} bytes; discarding", header.size);
                    self.reset();
                    return Err(TctiError::MalformedResponse { size: header.size });
                }
                debug!(tag = header.tag, size = header.size, code = header.code, "response header");
                self.header = Some(header);
                header
            }
        };
        let size = header.size as usize;

        let Some(buf) = response else {
            return Ok(size);
        };
        buf[..TPM_HEADER_SIZE].copy_from_slice(&self.frame[..TPM_HEADER_SIZE]);
        if size > TPM_HEADER_SIZE {
            if buf.len() < size {
                return Err(TctiError::InsufficientBuffer {
                    needed: size,
                    capacity: buf.len(),
                });
            }
            self.frame.resize(size, 0);
            self.fill(size, &mut wait)?;
            buf[TPM_HEADER_SIZE..size].copy_from_slice(&self.frame[TPM_HEADER_SIZE..size]);
        }
        self.reset();
        Ok(size)
    }

    /// Ask the resource manager to abandon the outstanding command.
    pub fn cancel(&mut self) -> Result<()> {
        info!("cancel: id 0x{:x}", self.session_id);
        self.expect_state(State::Receive)?;
        let session_id = self.session_id;
        match self.control.as_mut() {
            Some(control) => control.cancel(session_id),
            None => Err(TctiError::NotImplemented("cancel")),
        }
    }

    /// Set the locality for subsequent commands.
    pub fn set_locality(&mut self, locality: u8) -> Result<()> {
        info!("set_locality: id 0x{:x}, locality {}", self.session_id, locality);
        self.expect_state(State::Transmit)?;
        let session_id = self.session_id;
        match self.control.as_mut() {
            Some(control) => control.set_locality(session_id, locality),
            None => Err(TctiError::NotImplemented("set_locality")),
        }
    }

    /// Close the connection. Safe to call more than once.
    pub fn finalize(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            debug!(session_id = self.session_id, "finalize");
            if let Err(e) = channel.close() {
                warn!("Error closing connection: {}", e);
            }
        }
        self.control = None;
        self.state = State::Final;
    }
}

impl<C: Duplex> Drop for TctiContext<C> {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl<C: Duplex + fmt::Debug> fmt::Debug for TctiContext<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TctiContext")
            .field("state", &self.state)
            .field("channel", &self.channel)
            .field("session_id", &format_args!("0x{:x}", self.session_id))
            .field("index", &self.index)
            .field("header", &self.header)
            .finish()
    }
}
