/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Connection configuration
//!
//! Configurations can be built directly, deserialized with serde, or parsed
//! from the usual TCTI configuration string, a comma separated list of
//! `key=value` pairs:
//!
//! ```text
//! bus_name=com.intel.tss2.Tabrmd,bus_type=session
//! host=10.0.0.2,port=2323,tls=yes,cert=/etc/tpm/client.pem
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::TctiError;

/// Well-known name the broker registers under.
pub const DEFAULT_BUS_NAME: &str = "com.intel.tss2.Tabrmd";

/// Port a TLS-fronted resource manager listens on by default.
pub const DEFAULT_TLS_PORT: u16 = 2323;

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

const SOCKET_KEYS: &[&str] = &[
    "host",
    "port",
    "tls",
    "cert",
    "ca",
    "verify",
    "connect_timeout_ms",
];

/// Which bus the broker is reached on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusScope {
    /// Per-user session bus
    Session,
    /// System-wide bus
    #[default]
    System,
}

impl FromStr for BusScope {
    type Err = TctiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(BusScope::Session),
            "system" => Ok(BusScope::System),
            other => Err(TctiError::BadValue(format!("unknown bus type \"{other}\""))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub scope: BusScope,
    pub bus_name: String,
    /// Overrides the socket path derived from `scope` and `bus_name`.
    pub socket_path: Option<PathBuf>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            scope: BusScope::default(),
            bus_name: DEFAULT_BUS_NAME.to_string(),
            socket_path: None,
        }
    }
}

impl BrokerConfig {
    pub fn new(scope: BusScope, bus_name: impl Into<String>) -> Self {
        BrokerConfig {
            scope,
            bus_name: bus_name.into(),
            socket_path: None,
        }
    }

    pub fn with_socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }
}

/// How the server certificate is checked during the TLS handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerVerification {
    /// Reject any certificate that does not chain to `ca_file`.
    #[default]
    Strict,
    /// Log why the certificate would have been rejected, then accept it.
    LogAndAccept,
}

impl FromStr for ServerVerification {
    type Err = TctiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(ServerVerification::Strict),
            "log-and-accept" => Ok(ServerVerification::LogAndAccept),
            other => Err(TctiError::BadValue(format!(
                "unknown verification policy \"{other}\""
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// PEM file holding the client certificate chain and its private key.
    pub cert_file: Option<PathBuf>,
    /// PEM file with the trust anchors for [`ServerVerification::Strict`].
    pub ca_file: Option<PathBuf>,
    pub verification: ServerVerification,
    /// Must be positive.
    pub connect_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        SocketConfig {
            host: String::new(),
            port: DEFAULT_TLS_PORT,
            tls: false,
            cert_file: None,
            ca_file: None,
            verification: ServerVerification::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
        }
    }
}

impl SocketConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        SocketConfig {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    pub fn with_tls(mut self, verification: ServerVerification) -> Self {
        self.tls = true;
        self.verification = verification;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Either way of reaching the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TctiConfig {
    Broker(BrokerConfig),
    Socket(SocketConfig),
}

impl Default for TctiConfig {
    fn default() -> Self {
        TctiConfig::Broker(BrokerConfig::default())
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, TctiError> {
    match value {
        "yes" | "true" | "on" | "1" => Ok(true),
        "no" | "false" | "off" | "0" => Ok(false),
        _ => Err(TctiError::BadValue(format!("{key}: expected yes or no, got \"{value}\""))),
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, TctiError> {
    value
        .parse()
        .map_err(|_| TctiError::BadValue(format!("{key}: invalid number \"{value}\"")))
}

fn non_empty(key: &str, value: &str) -> Result<String, TctiError> {
    if value.is_empty() {
        return Err(TctiError::BadValue(format!("{key} must not be empty")));
    }
    Ok(value.to_string())
}

fn unknown_key(key: &str) -> TctiError {
    TctiError::BadValue(format!("unknown configuration key \"{key}\""))
}

impl FromStr for TctiConfig {
    type Err = TctiError;

    fn from_str(conf: &str) -> Result<Self, Self::Err> {
        let mut pairs = Vec::new();
        for item in conf.split(',').map(str::trim).filter(|item| !item.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(|| {
                TctiError::BadValue(format!("expected key=value, got \"{item}\""))
            })?;
            pairs.push((key.trim(), value.trim()));
        }

        if pairs.iter().any(|(key, _)| SOCKET_KEYS.contains(key)) {
            let mut config = SocketConfig::default();
            for (key, value) in pairs {
                match key {
                    "host" => config.host = non_empty(key, value)?,
                    "port" => config.port = parse_number(key, value)?,
                    "tls" => config.tls = parse_bool(key, value)?,
                    "cert" => config.cert_file = Some(PathBuf::from(non_empty(key, value)?)),
                    "ca" => config.ca_file = Some(PathBuf::from(non_empty(key, value)?)),
                    "verify" => config.verification = value.parse()?,
                    "connect_timeout_ms" => match parse_number(key, value)? {
                        0 => return Err(TctiError::BadValue(format!("{key} must be positive"))),
                        ms => config.connect_timeout_ms = ms,
                    },
                    _ => return Err(unknown_key(key)),
                }
            }
            if config.host.is_empty() {
                return Err(TctiError::BadValue("host is required".to_string()));
            }
            return Ok(TctiConfig::Socket(config));
        }

        let mut config = BrokerConfig::default();
        for (key, value) in pairs {
            match key {
                "bus_name" => config.bus_name = non_empty(key, value)?,
                "bus_type" => config.scope = value.parse()?,
                "socket" => config.socket_path = Some(PathBuf::from(non_empty(key, value)?)),
                _ => return Err(unknown_key(key)),
            }
        }
        Ok(TctiConfig::Broker(config))
    }
}
