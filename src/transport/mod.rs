//! Transport session abstraction
//!
//! The HTTP/3 layer runs on any multiplexed session that offers independent
//! unidirectional and bidirectional byte streams plus connection-level close
//! with an application error code. A QUIC library binding implements
//! [`Session`]; [`MemorySession`] provides an in-process pair for tests and
//! local tooling.

mod memory;

pub use memory::{CloseInfo, MemorySession, MemoryStream};

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by {by} with code {code:#x}: {reason}")]
    ApplicationClosed {
        code: u64,
        reason: String,
        by: Perspective,
    },

    #[error("Connection closed")]
    Closed,
}

/// Which end of the session this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Perspective {
    /// Initiated the session
    Client,
    /// Accepted the session
    Server,
}

impl Perspective {
    pub fn peer(self) -> Self {
        match self {
            Perspective::Client => Perspective::Server,
            Perspective::Server => Perspective::Client,
        }
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Perspective::Client => f.write_str("client"),
            Perspective::Server => f.write_str("server"),
        }
    }
}

/// QUIC stream identifier
///
/// The low two bits encode the initiator (bit 0) and directionality (bit 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl StreamId {
    pub fn initiator(self) -> Perspective {
        if self.0 & 1 == 0 {
            Perspective::Client
        } else {
            Perspective::Server
        }
    }

    pub fn is_unidirectional(self) -> bool {
        self.0 & 2 != 0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Common surface of every transport stream
pub trait Stream: Send + Unpin + 'static {
    fn id(&self) -> StreamId;
}

/// Receive half of a stream
pub trait RecvStream: Stream + AsyncRead {
    /// Ask the peer to stop sending, with an application error code
    fn stop_sending(&mut self, code: u64);
}

/// Send half of a stream
pub trait SendStream: Stream + AsyncWrite {
    /// Abandon the stream, with an application error code
    fn reset(&mut self, code: u64);
}

/// A stream carrying data in both directions
pub trait BidiStream: RecvStream + SendStream {}

impl<T: RecvStream + SendStream> BidiStream for T {}

/// A multiplexed transport session
#[async_trait]
pub trait Session: Send + Sync + 'static {
    type SendStream: SendStream;
    type RecvStream: RecvStream;
    type BidiStream: BidiStream;

    fn perspective(&self) -> Perspective;

    /// Open a send-only stream
    async fn open_uni(&self) -> Result<Self::SendStream, TransportError>;

    /// Wait for the peer to open a unidirectional stream
    async fn accept_uni(&self) -> Result<Self::RecvStream, TransportError>;

    /// Open a bidirectional stream, waiting for stream credit if necessary
    async fn open_bi(&self) -> Result<Self::BidiStream, TransportError>;

    /// Wait for the peer to open a bidirectional stream
    async fn accept_bi(&self) -> Result<Self::BidiStream, TransportError>;

    /// Whether unreliable datagrams were negotiated
    ///
    /// May wait for the transport handshake to complete.
    async fn supports_datagrams(&self) -> bool;

    /// Close the whole session with an application error code
    fn close_with_error(&self, code: u64, reason: &str);

    /// Token cancelled when the session ends, locally or remotely
    fn lifetime(&self) -> CancellationToken;
}
