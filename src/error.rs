//! Error types for TCTI operations

use std::io;

use thiserror::Error;

use crate::context::State;

/// Response code layer reserved for TCTI errors.
pub const TCTI_RC_LAYER: u32 = 10 << 16;

const LAYER_MASK: u32 = 0xFFFF_0000;

/// Base codes shared by every TSS2 layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum BaseRc {
    GeneralFailure = 1,
    NotImplemented = 2,
    BadContext = 3,
    AbiMismatch = 4,
    BadReference = 5,
    InsufficientBuffer = 6,
    BadSequence = 7,
    NoConnection = 8,
    TryAgain = 9,
    IoError = 10,
    BadValue = 11,
    NotPermitted = 12,
    MalformedResponse = 17,
    NotSupported = 21,
}

impl BaseRc {
    fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Self::GeneralFailure,
            2 => Self::NotImplemented,
            3 => Self::BadContext,
            4 => Self::AbiMismatch,
            5 => Self::BadReference,
            6 => Self::InsufficientBuffer,
            7 => Self::BadSequence,
            8 => Self::NoConnection,
            9 => Self::TryAgain,
            10 => Self::IoError,
            11 => Self::BadValue,
            12 => Self::NotPermitted,
            17 => Self::MalformedResponse,
            21 => Self::NotSupported,
            _ => return None,
        })
    }

    /// The full response code in the TCTI layer.
    pub fn tcti_rc(self) -> u32 {
        TCTI_RC_LAYER | self as u32
    }
}

/// TCTI error types
#[derive(Debug, Error)]
pub enum TctiError {
    /// A required reference was missing
    #[error("Bad reference: {0}")]
    BadReference(String),

    /// An argument was out of range or empty
    #[error("Bad value: {0}")]
    BadValue(String),

    /// Operation invoked in the wrong state
    #[error("Operation not valid in {0:?} state")]
    BadSequence(State),

    /// Caller buffer too small; retry with a larger one
    #[error("Insufficient buffer: need {needed} bytes, got {capacity}")]
    InsufficientBuffer { needed: usize, capacity: usize },

    /// Failed write or read fault
    #[error("I/O error: {0}")]
    Io(#[source] io::Error),

    /// Peer closed or unreachable
    #[error("No connection: {0}")]
    NoConnection(String),

    /// Nothing to do yet; the same call should be repeated
    #[error("Try again")]
    TryAgain,

    /// Response header declared a size smaller than the header itself
    #[error("Malformed response: header declares {size} bytes")]
    MalformedResponse { size: u32 },

    /// Catch-all for faults with no better mapping
    #[error("General failure: {0}")]
    GeneralFailure(String),

    /// Context creation failed; nothing was returned to the caller
    #[error("Failed to establish connection: {0}")]
    Establishment(String),

    /// The context has no way to perform this operation
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Status code reported by the peer outside the TCTI layer
    #[error("Peer reported response code 0x{code:08x}")]
    Remote { code: u32 },
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, TctiError>;

impl TctiError {
    /// The TSS2 response code for this error.
    pub fn rc(&self) -> u32 {
        let base = match self {
            Self::BadReference(_) => BaseRc::BadReference,
            Self::BadValue(_) => BaseRc::BadValue,
            Self::BadSequence(_) => BaseRc::BadSequence,
            Self::InsufficientBuffer { .. } => BaseRc::InsufficientBuffer,
            Self::Io(_) => BaseRc::IoError,
            Self::NoConnection(_) | Self::Establishment(_) => BaseRc::NoConnection,
            Self::TryAgain => BaseRc::TryAgain,
            Self::MalformedResponse { .. } => BaseRc::MalformedResponse,
            Self::GeneralFailure(_) => BaseRc::GeneralFailure,
            Self::NotImplemented(_) => BaseRc::NotImplemented,
            Self::Remote { code } => return *code,
        };
        base.tcti_rc()
    }

    /// True for conditions a well-behaved caller simply retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TryAgain | Self::InsufficientBuffer { .. })
    }

    /// Map a status code reported by the peer.
    ///
    /// Zero is success. Codes in the TCTI layer map onto the matching
    /// variant; everything else is returned as [`TctiError::Remote`].
    pub fn check_rc(code: u32) -> Result<()> {
        if code == 0 {
            return Ok(());
        }
        if code & LAYER_MASK != TCTI_RC_LAYER {
            return Err(Self::Remote { code });
        }
        let Some(base) = BaseRc::from_u32(code & !LAYER_MASK) else {
            return Err(Self::Remote { code });
        };
        let reported = || format!("peer reported 0x{code:08x}");
        Err(match base {
            BaseRc::GeneralFailure => Self::GeneralFailure(reported()),
            BaseRc::BadReference => Self::BadReference(reported()),
            BaseRc::BadValue => Self::BadValue(reported()),
            BaseRc::NoConnection => Self::NoConnection(reported()),
            BaseRc::TryAgain => Self::TryAgain,
            BaseRc::IoError => Self::Io(io::Error::other(reported())),
            _ => Self::Remote { code },
        })
    }
}

impl From<io::Error> for TctiError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::WouldBlock => return TctiError::TryAgain,
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected => {
                return TctiError::NoConnection(error.to_string());
            }
            _ => {}
        }
        match error.raw_os_error() {
            Some(libc::EIO) => TctiError::Io(error),
            _ => {
                tracing::debug!("mapping \"{}\" to general failure", error);
                TctiError::GeneralFailure(error.to_string())
            }
        }
    }
}
