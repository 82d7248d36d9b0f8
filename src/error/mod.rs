//! HTTP/3 application error codes and the error values used to signal
//! connection closure and stream resets
//!
//! The transport only carries a bare integer when a connection is closed or
//! a stream is reset. [`ConnError`] and [`StreamError`] pair one of the
//! catalogued [`ErrorCode`]s with the underlying cause so the rest of the
//! crate can say "close the connection" or "reset this stream" without
//! touching transport types.

use crate::frame::FrameType;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// An HTTP/3 application error code (RFC 9114 Section 8.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorCode(u64);

impl ErrorCode {
    pub const NO_ERROR: Self = Self(0x100);
    pub const GENERAL_PROTOCOL_ERROR: Self = Self(0x101);
    pub const INTERNAL_ERROR: Self = Self(0x102);
    pub const STREAM_CREATION_ERROR: Self = Self(0x103);
    pub const CLOSED_CRITICAL_STREAM: Self = Self(0x104);
    pub const FRAME_UNEXPECTED: Self = Self(0x105);
    pub const FRAME_ERROR: Self = Self(0x106);
    pub const EXCESSIVE_LOAD: Self = Self(0x107);
    pub const ID_ERROR: Self = Self(0x108);
    pub const SETTINGS_ERROR: Self = Self(0x109);
    pub const MISSING_SETTINGS: Self = Self(0x10a);
    pub const REQUEST_REJECTED: Self = Self(0x10b);
    pub const REQUEST_CANCELLED: Self = Self(0x10c);
    pub const REQUEST_INCOMPLETE: Self = Self(0x10d);
    pub const MESSAGE_ERROR: Self = Self(0x10e);
    pub const CONNECT_ERROR: Self = Self(0x10f);
    pub const VERSION_FALLBACK: Self = Self(0x110);

    /// draft-ietf-webtrans-http3-01 Section 7.5
    pub const WEBTRANSPORT_BUFFERED_STREAM_REJECTED: Self = Self(0x3994_bd84);

    pub const fn new(code: u64) -> Self {
        Self(code)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Canonical name of a catalogued code
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            Self::NO_ERROR => "H3_NO_ERROR",
            Self::GENERAL_PROTOCOL_ERROR => "H3_GENERAL_PROTOCOL_ERROR",
            Self::INTERNAL_ERROR => "H3_INTERNAL_ERROR",
            Self::STREAM_CREATION_ERROR => "H3_STREAM_CREATION_ERROR",
            Self::CLOSED_CRITICAL_STREAM => "H3_CLOSED_CRITICAL_STREAM",
            Self::FRAME_UNEXPECTED => "H3_FRAME_UNEXPECTED",
            Self::FRAME_ERROR => "H3_FRAME_ERROR",
            Self::EXCESSIVE_LOAD => "H3_EXCESSIVE_LOAD",
            Self::ID_ERROR => "H3_ID_ERROR",
            Self::SETTINGS_ERROR => "H3_SETTINGS_ERROR",
            Self::MISSING_SETTINGS => "H3_MISSING_SETTINGS",
            Self::REQUEST_REJECTED => "H3_REQUEST_REJECTED",
            Self::REQUEST_CANCELLED => "H3_REQUEST_CANCELLED",
            Self::REQUEST_INCOMPLETE => "H3_INCOMPLETE_REQUEST",
            Self::MESSAGE_ERROR => "H3_MESSAGE_ERROR",
            Self::CONNECT_ERROR => "H3_CONNECT_ERROR",
            Self::VERSION_FALLBACK => "H3_VERSION_FALLBACK",
            Self::WEBTRANSPORT_BUFFERED_STREAM_REJECTED => {
                "H3_WEBTRANSPORT_BUFFERED_STREAM_REJECTED"
            }
            _ => return None,
        };
        Some(name)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown error code: {:#x}", self.0),
        }
    }
}

impl From<ErrorCode> for u64 {
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

impl From<u64> for ErrorCode {
    fn from(code: u64) -> Self {
        Self(code)
    }
}

/// Shared, clonable error cause
pub type Cause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// A plain-text cause for errors that have no underlying error value
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct Reason(pub Cow<'static, str>);

/// A frame of one type arrived where another was required
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unexpected frame type {got}, expected {want}")]
pub struct FrameTypeError {
    pub want: FrameType,
    pub got: FrameType,
    /// Declared payload length of the offending frame
    pub len: u64,
}

/// A frame declared a payload larger than allowed for its type
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{frame_type} frame too large: {length} bytes (max: {max})")]
pub struct FrameLengthError {
    pub frame_type: FrameType,
    pub length: u64,
    pub max: u64,
}

/// An error that closes the whole connection
#[derive(Debug, Clone, Error)]
#[error("connection error {code}: {cause}")]
pub struct ConnError {
    pub code: ErrorCode,
    #[source]
    pub cause: Cause,
}

impl ConnError {
    pub fn new<E>(code: ErrorCode, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code,
            cause: Arc::new(cause),
        }
    }

    pub fn msg(code: ErrorCode, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(code, Reason(reason.into()))
    }

    /// Message sent to the peer alongside the code
    pub fn reason(&self) -> String {
        self.cause.to_string()
    }
}

/// An error that resets a single stream
#[derive(Debug, Clone, Error)]
#[error("stream error {code}: {cause}")]
pub struct StreamError {
    pub code: ErrorCode,
    #[source]
    pub cause: Cause,
}

impl StreamError {
    pub fn new<E>(code: ErrorCode, cause: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            code,
            cause: Arc::new(cause),
        }
    }

    pub fn msg(code: ErrorCode, reason: impl Into<Cow<'static, str>>) -> Self {
        Self::new(code, Reason(reason.into()))
    }
}
