//! In-process session pair
//!
//! Streams are backed by `tokio::io::duplex` pipes and handed to the peer
//! through per-endpoint queues. Stream ids follow the QUIC numbering rules,
//! bidirectional streams are limited by a per-endpoint credit, and both
//! endpoints share one close state so either side can observe who closed the
//! session and with which code.

use super::{Perspective, RecvStream, SendStream, Session, Stream, StreamId, TransportError};
use crate::config::MemoryConfig;
use async_trait::async_trait;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// How and by whom a session was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u64,
    pub reason: String,
    pub by: Perspective,
}

/// Streams travelling towards one endpoint
struct Inbox {
    uni_tx: mpsc::UnboundedSender<MemoryStream>,
    uni_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    bidi_tx: mpsc::UnboundedSender<MemoryStream>,
    bidi_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MemoryStream>>,
    /// Bidirectional streams the peer may have open towards this endpoint
    bidi_credit: Arc<Semaphore>,
}

impl Inbox {
    fn new(max_bidi_streams: usize) -> Self {
        let (uni_tx, uni_rx) = mpsc::unbounded_channel();
        let (bidi_tx, bidi_rx) = mpsc::unbounded_channel();
        Self {
            uni_tx,
            uni_rx: tokio::sync::Mutex::new(uni_rx),
            bidi_tx,
            bidi_rx: tokio::sync::Mutex::new(bidi_rx),
            bidi_credit: Arc::new(Semaphore::new(max_bidi_streams)),
        }
    }
}

/// State shared by both endpoints
struct Link {
    lifetime: CancellationToken,
    close: Mutex<Option<CloseInfo>>,
    cancellations: Mutex<Vec<(StreamId, u64)>>,
    client: Inbox,
    server: Inbox,
    datagrams: bool,
    stream_buffer: usize,
}

impl Link {
    fn inbox(&self, side: Perspective) -> &Inbox {
        match side {
            Perspective::Client => &self.client,
            Perspective::Server => &self.server,
        }
    }

    fn close_info(&self) -> MutexGuard<'_, Option<CloseInfo>> {
        self.close.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> TransportError {
        match self.close_info().clone() {
            Some(info) => TransportError::ApplicationClosed {
                code: info.code,
                reason: info.reason,
                by: info.by,
            },
            None => TransportError::Closed,
        }
    }

    fn record_cancellation(&self, id: StreamId, code: u64) {
        self.cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, code));
    }
}

/// One endpoint of an in-process session
pub struct MemorySession {
    perspective: Perspective,
    link: Arc<Link>,
    next_uni: AtomicU64,
    next_bidi: AtomicU64,
}

impl MemorySession {
    /// Create a connected `(client, server)` pair
    pub fn pair(config: &MemoryConfig) -> (Self, Self) {
        let link = Arc::new(Link {
            lifetime: CancellationToken::new(),
            close: Mutex::new(None),
            cancellations: Mutex::new(Vec::new()),
            client: Inbox::new(config.max_bidi_streams),
            server: Inbox::new(config.max_bidi_streams),
            datagrams: config.datagrams,
            stream_buffer: config.stream_buffer.max(1),
        });

        let client = Self::new(Perspective::Client, link.clone());
        let server = Self::new(Perspective::Server, link);
        (client, server)
    }

    fn new(perspective: Perspective, link: Arc<Link>) -> Self {
        let initiator_bit = match perspective {
            Perspective::Client => 0,
            Perspective::Server => 1,
        };
        Self {
            perspective,
            link,
            next_bidi: AtomicU64::new(initiator_bit),
            next_uni: AtomicU64::new(initiator_bit | 2),
        }
    }

    /// Close state, once either endpoint has closed the session
    pub fn close_info(&self) -> Option<CloseInfo> {
        self.link.close_info().clone()
    }

    /// Receive streams stopped and send streams reset on either endpoint,
    /// in order, with their error codes
    pub fn cancellations(&self) -> Vec<(StreamId, u64)> {
        self.link
            .cancellations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until the session has been closed by either endpoint
    pub async fn closed(&self) {
        self.link.lifetime.cancelled().await
    }

    fn stream(
        &self,
        id: StreamId,
        io: DuplexStream,
        credit: Option<Arc<OwnedSemaphorePermit>>,
    ) -> MemoryStream {
        MemoryStream {
            id,
            io,
            link: self.link.clone(),
            stopped: None,
            reset: None,
            _credit: credit,
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    type SendStream = MemoryStream;
    type RecvStream = MemoryStream;
    type BidiStream = MemoryStream;

    fn perspective(&self) -> Perspective {
        self.perspective
    }

    async fn open_uni(&self) -> Result<MemoryStream, TransportError> {
        if self.link.lifetime.is_cancelled() {
            return Err(self.link.closed_error());
        }

        let id = StreamId(self.next_uni.fetch_add(4, Ordering::Relaxed));
        let (local, remote) = tokio::io::duplex(self.link.stream_buffer);
        self.link
            .inbox(self.perspective.peer())
            .uni_tx
            .send(self.stream(id, remote, None))
            .map_err(|_| TransportError::Closed)?;

        trace!(stream_id = %id, "opened unidirectional stream");
        Ok(self.stream(id, local, None))
    }

    async fn accept_uni(&self) -> Result<MemoryStream, TransportError> {
        let mut rx = self.link.inbox(self.perspective).uni_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.link.lifetime.cancelled() => Err(self.link.closed_error()),
            stream = rx.recv() => stream.ok_or(TransportError::Closed),
        }
    }

    async fn open_bi(&self) -> Result<MemoryStream, TransportError> {
        let credit = self.link.inbox(self.perspective.peer()).bidi_credit.clone();
        let permit = tokio::select! {
            biased;
            _ = self.link.lifetime.cancelled() => return Err(self.link.closed_error()),
            permit = credit.acquire_owned() => permit.map_err(|_| TransportError::Closed)?,
        };
        let permit = Arc::new(permit);

        let id = StreamId(self.next_bidi.fetch_add(4, Ordering::Relaxed));
        let (local, remote) = tokio::io::duplex(self.link.stream_buffer);
        self.link
            .inbox(self.perspective.peer())
            .bidi_tx
            .send(self.stream(id, remote, Some(permit.clone())))
            .map_err(|_| TransportError::Closed)?;

        trace!(stream_id = %id, "opened bidirectional stream");
        Ok(self.stream(id, local, Some(permit)))
    }

    async fn accept_bi(&self) -> Result<MemoryStream, TransportError> {
        let mut rx = self.link.inbox(self.perspective).bidi_rx.lock().await;
        tokio::select! {
            biased;
            _ = self.link.lifetime.cancelled() => Err(self.link.closed_error()),
            stream = rx.recv() => stream.ok_or(TransportError::Closed),
        }
    }

    async fn supports_datagrams(&self) -> bool {
        self.link.datagrams
    }

    fn close_with_error(&self, code: u64, reason: &str) {
        {
            let mut close = self.link.close_info();
            if close.is_some() {
                return;
            }
            *close = Some(CloseInfo {
                code,
                reason: reason.to_string(),
                by: self.perspective,
            });
        }
        debug!(side = %self.perspective, code, reason, "session closed");
        self.link.lifetime.cancel();
    }

    fn lifetime(&self) -> CancellationToken {
        self.link.lifetime.clone()
    }
}

/// One end of an in-process stream
pub struct MemoryStream {
    id: StreamId,
    io: DuplexStream,
    link: Arc<Link>,
    stopped: Option<u64>,
    reset: Option<u64>,
    /// Bidirectional stream credit, returned once both ends are dropped
    _credit: Option<Arc<OwnedSemaphorePermit>>,
}

impl Stream for MemoryStream {
    fn id(&self) -> StreamId {
        self.id
    }
}

impl RecvStream for MemoryStream {
    fn stop_sending(&mut self, code: u64) {
        if self.stopped.is_none() {
            self.stopped = Some(code);
            self.link.record_cancellation(self.id, code);
        }
    }
}

impl SendStream for MemoryStream {
    fn reset(&mut self, code: u64) {
        if self.reset.is_none() {
            self.reset = Some(code);
            self.link.record_cancellation(self.id, code);
        }
    }
}

fn cancelled(what: &str, code: u64) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionAborted,
        format!("stream {} with code {:#x}", what, code),
    )
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if let Some(code) = this.stopped {
            return Poll::Ready(Err(cancelled("stopped", code)));
        }
        Pin::new(&mut this.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if let Some(code) = this.reset {
            return Poll::Ready(Err(cancelled("reset", code)));
        }
        Pin::new(&mut this.io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_uni_stream_ids_and_delivery() {
        let (client, server) = MemorySession::pair(&MemoryConfig::default());

        let mut first = client.open_uni().await.unwrap();
        let second = client.open_uni().await.unwrap();
        assert_eq!(first.id(), StreamId(2));
        assert_eq!(second.id(), StreamId(6));
        assert!(first.id().is_unidirectional());
        assert_eq!(first.id().initiator(), Perspective::Client);

        first.write_all(b"hello").await.unwrap();
        drop(first);

        let mut incoming = server.accept_uni().await.unwrap();
        assert_eq!(incoming.id(), StreamId(2));
        let mut data = Vec::new();
        incoming.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello");

        let server_uni = server.open_uni().await.unwrap();
        assert_eq!(server_uni.id(), StreamId(3));
    }

    #[tokio::test]
    async fn test_bidi_credit_blocks_until_released() {
        let config = MemoryConfig {
            max_bidi_streams: 1,
            ..MemoryConfig::default()
        };
        let (client, server) = MemorySession::pair(&config);

        let first = client.open_bi().await.unwrap();
        assert_eq!(first.id(), StreamId(0));

        // No credit left
        assert!(timeout(Duration::from_millis(50), client.open_bi())
            .await
            .is_err());

        let accepted = server.accept_bi().await.unwrap();
        drop(first);
        drop(accepted);

        let second = timeout(Duration::from_secs(5), client.open_bi())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id(), StreamId(4));
    }

    #[tokio::test]
    async fn test_close_unblocks_accept_and_keeps_first_reason() {
        let (client, server) = MemorySession::pair(&MemoryConfig::default());

        let waiter = tokio::spawn(async move {
            let result = server.accept_uni().await;
            (server, result)
        });

        client.close_with_error(0x10a, "missing settings");
        client.close_with_error(0x100, "ignored");

        let (server, result) = timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        match result {
            Err(TransportError::ApplicationClosed { code, by, .. }) => {
                assert_eq!(code, 0x10a);
                assert_eq!(by, Perspective::Client);
            }
            other => panic!("expected application close, got {:?}", other.map(|s| s.id())),
        }

        let info = server.close_info().unwrap();
        assert_eq!(info.reason, "missing settings");
        assert!(server.open_uni().await.is_err());
    }

    #[tokio::test]
    async fn test_stop_sending_is_recorded() {
        let (client, server) = MemorySession::pair(&MemoryConfig::default());
        let _tx = client.open_uni().await.unwrap();
        let mut rx = server.accept_uni().await.unwrap();

        rx.stop_sending(0x101);
        let mut buf = [0u8; 1];
        assert!(rx.read(&mut buf).await.is_err());
        assert_eq!(client.cancellations(), vec![(StreamId(2), 0x101)]);
    }
}
