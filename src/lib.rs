//! # h3conn
//!
//! The connection layer of HTTP/3 on top of a multiplexed QUIC-style
//! session.
//!
//! ## Features
//!
//! - **SETTINGS handshake** over the control stream, with HTTP datagram
//!   negotiation checked against the transport
//! - **Unidirectional stream demultiplexing** by stream type, enforcing one
//!   stream per reserved type
//! - **Request streams** opened by the client and accepted by the server
//! - **Application stream types** (such as WebTransport) handed to the caller
//! - **In-process transport** for tests and local tooling
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Application                       │
//! │        (request streams, typed uni streams)          │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Layer                     │
//! │   (control stream, SETTINGS, stream type demux)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Frame Codec                         │
//! │            (varints, frames, SETTINGS)               │
//! ├─────────────────────────────────────────────────────┤
//! │                Transport Session                     │
//! │          (QUIC binding or in-memory pair)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod stream;
pub mod transport;
pub mod varint;

pub use config::Config;
pub use connection::{Connection, ConnectionState};
pub use error::{ConnError, ErrorCode, StreamError};
pub use frame::{Setting, Settings};
pub use stream::{ReadableStream, RequestStream, StreamType, WritableStream};
pub use transport::{Perspective, Session};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Frame error: {0}")]
    Frame(#[from] frame::FrameError),

    #[error(transparent)]
    Conn(#[from] ConnError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("{operation} is only available on the {expected} side")]
    Perspective {
        operation: &'static str,
        expected: Perspective,
    },

    #[error("Invalid stream type: {0}")]
    InvalidStreamType(StreamType),

    #[error("{0} already opened on this connection")]
    DuplicateStreamType(StreamType),

    #[error("Session closed")]
    SessionClosed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<varint::VarintError> for Error {
    fn from(err: varint::VarintError) -> Self {
        Error::Frame(err.into())
    }
}

impl Error {
    /// The HTTP/3 error code the connection was closed with, if any
    pub fn conn_code(&self) -> Option<ErrorCode> {
        match self {
            Error::Conn(err) => Some(err.code),
            _ => None,
        }
    }
}
