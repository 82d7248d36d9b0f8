//! Transport streams decorated with their HTTP/3 role
//!
//! Wrappers hold a weak reference to the owning connection, so a stream that
//! outlives its connection can still be read or written but can no longer
//! close it.

use super::StreamType;
use crate::error::{ConnError, StreamError};
use crate::transport::{BidiStream, RecvStream, SendStream, StreamId};
use std::io;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// What a stream may ask of its connection
pub(crate) trait ConnHandle: Send + Sync {
    fn close_with(&self, err: ConnError);
}

pub(crate) type ConnRef = Weak<dyn ConnHandle>;

fn close_through(conn: &ConnRef, err: ConnError) -> bool {
    match conn.upgrade() {
        Some(conn) => {
            conn.close_with(err);
            true
        }
        None => false,
    }
}

/// An incoming unidirectional stream
pub struct ReadableStream<R> {
    inner: R,
    stream_type: StreamType,
    conn: ConnRef,
}

impl<R: RecvStream> ReadableStream<R> {
    pub(crate) fn new(inner: R, stream_type: StreamType, conn: ConnRef) -> Self {
        Self {
            inner,
            stream_type,
            conn,
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id()
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Stop reading, telling the peer why
    pub fn cancel(&mut self, err: &StreamError) {
        self.inner.stop_sending(err.code.into());
    }

    /// Close the owning connection
    ///
    /// Returns `false` if the connection is already gone.
    pub fn close_connection(&self, err: ConnError) -> bool {
        close_through(&self.conn, err)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: RecvStream> AsyncRead for ReadableStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

/// An outgoing unidirectional stream whose type prefix has been written
pub struct WritableStream<W> {
    inner: W,
    stream_type: StreamType,
    conn: ConnRef,
}

impl<W: SendStream> WritableStream<W> {
    pub(crate) fn new(inner: W, stream_type: StreamType, conn: ConnRef) -> Self {
        Self {
            inner,
            stream_type,
            conn,
        }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id()
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    /// Abandon the stream, telling the peer why
    pub fn reset(&mut self, err: &StreamError) {
        self.inner.reset(err.code.into());
    }

    /// Close the owning connection
    ///
    /// Returns `false` if the connection is already gone.
    pub fn close_connection(&self, err: ConnError) -> bool {
        close_through(&self.conn, err)
    }
}

impl<W: SendStream> AsyncWrite for WritableStream<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A bidirectional request stream
pub struct RequestStream<B> {
    inner: B,
    conn: ConnRef,
}

impl<B: BidiStream> RequestStream<B> {
    pub(crate) fn new(inner: B, conn: ConnRef) -> Self {
        Self { inner, conn }
    }

    pub fn id(&self) -> StreamId {
        self.inner.id()
    }

    /// Stop reading the request or response body
    pub fn cancel_read(&mut self, err: &StreamError) {
        self.inner.stop_sending(err.code.into());
    }

    /// Abandon the sending side
    pub fn reset(&mut self, err: &StreamError) {
        self.inner.reset(err.code.into());
    }

    /// Close the owning connection
    ///
    /// Returns `false` if the connection is already gone.
    pub fn close_connection(&self, err: ConnError) -> bool {
        close_through(&self.conn, err)
    }
}

impl<B: BidiStream> AsyncRead for RequestStream<B> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<B: BidiStream> AsyncWrite for RequestStream<B> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
