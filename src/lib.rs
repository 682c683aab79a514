/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! TCTI client for a TPM2 resource manager.
//!
//! A [`TctiContext`] carries TPM2 command buffers to a resource manager and
//! reassembles the response frames it sends back. The resource manager is
//! reached either through a local broker that hands out a connected
//! descriptor ([`TctiContext::connect_broker`]) or directly over TCP with
//! optional TLS ([`TctiContext::connect_socket`]).
//!
//! ```no_run
//! use tss_tcti_rm::{TctiConfig, TctiContext, TIMEOUT_BLOCK};
//!
//! # fn main() -> tss_tcti_rm::Result<()> {
//! let config: TctiConfig = "host=tpm.local,port=2323,tls=yes,ca=/etc/tpm/ca.pem".parse()?;
//! let mut ctx = TctiContext::connect(&config)?;
//! ctx.transmit(&[0x80, 0x01, 0, 0, 0, 12, 0, 0, 1, 0x7B, 0, 8])?;
//! let mut response = vec![0u8; ctx.receive(None, TIMEOUT_BLOCK)?];
//! ctx.receive(Some(&mut response), TIMEOUT_BLOCK)?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod broker;
pub mod channel;
pub mod config;
pub mod context;
pub mod error;
pub mod header;
pub mod io;
pub mod poll;
pub mod socket;
pub mod tls;

pub use channel::{Channel, Duplex};
pub use config::{BrokerConfig, BusScope, ServerVerification, SocketConfig, TctiConfig};
pub use context::{State, TctiContext, TIMEOUT_BLOCK, TIMEOUT_NONE};
pub use error::{Result, TctiError};
pub use header::ResponseHeader;
