//! HTTP/3 connection over a transport session
//!
//! Handles the full lifecycle of the HTTP/3 layer:
//! - opening the local control stream and announcing SETTINGS
//! - classifying every incoming unidirectional stream by its type prefix
//! - reading the peer's SETTINGS and checking datagram support
//! - opening and accepting request streams and application typed streams
//!
//! A background task accepts incoming unidirectional streams and spawns one
//! short-lived handler per stream. The task and its handlers are aborted
//! when the session ends or the [`Connection`] is dropped.

mod set_once;

use self::set_once::SetOnce;
use crate::config::ConnectionConfig;
use crate::error::{ConnError, ErrorCode};
use crate::frame::{self, Frame, FrameError, FrameType, Settings};
use crate::stream::{
    ConnHandle, ConnRef, ReadableStream, RequestStream, StreamSlots, StreamType, WritableStream,
};
use crate::transport::{Perspective, RecvStream, Session, Stream, StreamId};
use crate::{varint, Error, Result};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio_util::task::AbortOnDropHandle;
use tracing::{debug, info, trace, warn};

/// Handshake progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Local settings chosen, nothing written yet
    Initializing,
    /// Control stream opened and local SETTINGS written
    ControlStreamOpen,
    /// Waiting for the peer's SETTINGS
    AwaitingPeerSettings,
    /// Peer SETTINGS received and accepted
    SettingsNegotiated,
    /// The handshake failed and the connection was closed
    SettingsFailed,
}

type PeerSettings = std::result::Result<Settings, ConnError>;

/// A claimed peer stream of a reserved type
struct PeerStream<R> {
    id: StreamId,
    /// QPACK streams are kept open but not read
    _parked: Option<ReadableStream<R>>,
}

struct Inner<S: Session> {
    session: S,
    perspective: Perspective,
    settings: Settings,
    peer_settings: SetOnce<PeerSettings>,
    peer_streams: Mutex<StreamSlots<PeerStream<S::RecvStream>>>,
    local_streams: Mutex<StreamSlots<StreamId>>,
    incoming_tx: mpsc::Sender<ReadableStream<S::RecvStream>>,
    incoming_rx: Mutex<mpsc::Receiver<ReadableStream<S::RecvStream>>>,
    handler_limit: Arc<Semaphore>,
}

/// An HTTP/3 connection
pub struct Connection<S: Session> {
    inner: Arc<Inner<S>>,
    /// Kept open for the life of the connection; the peer treats its
    /// closure as a connection error
    _control: WritableStream<S::SendStream>,
    _driver: AbortOnDropHandle<()>,
}

impl<S: Session> Connection<S> {
    /// Establish the client side of an HTTP/3 connection
    ///
    /// With `settings` of `None`, HTTP datagrams are announced if the
    /// transport negotiated datagram support, which may wait for the
    /// transport handshake to finish.
    pub async fn open(session: S, settings: Option<Settings>) -> Result<Self> {
        Self::open_with_config(session, settings, &ConnectionConfig::default()).await
    }

    /// Establish the server side of an HTTP/3 connection
    pub async fn accept(session: S, settings: Option<Settings>) -> Result<Self> {
        Self::accept_with_config(session, settings, &ConnectionConfig::default()).await
    }

    pub async fn open_with_config(
        session: S,
        settings: Option<Settings>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        Self::establish(session, Perspective::Client, "Connection::open", settings, config).await
    }

    pub async fn accept_with_config(
        session: S,
        settings: Option<Settings>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        Self::establish(session, Perspective::Server, "Connection::accept", settings, config).await
    }

    async fn establish(
        session: S,
        side: Perspective,
        operation: &'static str,
        settings: Option<Settings>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        if session.perspective() != side {
            return Err(Error::Perspective {
                operation,
                expected: side,
            });
        }

        let settings = match settings {
            Some(settings) => settings,
            None => default_settings(&session, config).await,
        };
        trace!(%side, state = ?ConnectionState::Initializing, %settings, "establishing HTTP/3 connection");

        let (incoming_tx, incoming_rx) = mpsc::channel(config.incoming_stream_queue.max(1));
        let inner = Arc::new(Inner {
            session,
            perspective: side,
            settings,
            peer_settings: SetOnce::new(),
            peer_streams: Mutex::new(StreamSlots::new()),
            local_streams: Mutex::new(StreamSlots::new()),
            incoming_tx,
            incoming_rx: Mutex::new(incoming_rx),
            handler_limit: Arc::new(Semaphore::new(config.max_uni_stream_handlers.max(1))),
        });

        let mut control = inner.open_typed(StreamType::CONTROL).await?;
        frame::write_frame(&mut control, &inner.settings).await?;
        control.flush().await?;
        trace!(%side, stream_id = %control.id(), state = ?ConnectionState::ControlStreamOpen, "sent SETTINGS");

        let driver = tokio::spawn(inner.clone().accept_uni_streams());
        debug!(%side, state = ?ConnectionState::AwaitingPeerSettings, "HTTP/3 connection open");

        Ok(Self {
            inner,
            _control: control,
            _driver: AbortOnDropHandle::new(driver),
        })
    }

    pub fn perspective(&self) -> Perspective {
        self.inner.perspective
    }

    /// The underlying transport session
    pub fn session(&self) -> &S {
        &self.inner.session
    }

    /// Settings announced to the peer
    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        match self.inner.peer_settings.peek() {
            None => ConnectionState::AwaitingPeerSettings,
            Some(Ok(_)) => ConnectionState::SettingsNegotiated,
            Some(Err(_)) => ConnectionState::SettingsFailed,
        }
    }

    /// The peer's settings
    ///
    /// Waits until the peer's SETTINGS frame has been processed. If the
    /// handshake failed, returns the error the connection was closed with.
    pub async fn peer_settings(&self) -> Result<Settings> {
        let lifetime = self.inner.session.lifetime();
        tokio::select! {
            biased;
            result = self.inner.peer_settings.get() => result.map_err(Error::from),
            _ = lifetime.cancelled() => match self.inner.peer_settings.peek() {
                Some(result) => result.map_err(Error::from),
                None => Err(Error::SessionClosed),
            },
        }
    }

    /// Wait for the client to open a request stream (server only)
    pub async fn accept_request_stream(&self) -> Result<RequestStream<S::BidiStream>> {
        self.require(Perspective::Server, "accept_request_stream")?;

        let lifetime = self.inner.session.lifetime();
        let stream = tokio::select! {
            biased;
            accepted = self.inner.session.accept_bi() => accepted?,
            _ = lifetime.cancelled() => return Err(Error::SessionClosed),
        };
        trace!(stream_id = %stream.id(), "accepted request stream");
        Ok(RequestStream::new(stream, self.inner.conn_ref()))
    }

    /// Open a request stream (client only)
    ///
    /// Waits while the peer's stream limit is reached.
    pub async fn open_request_stream(&self) -> Result<RequestStream<S::BidiStream>> {
        self.require(Perspective::Client, "open_request_stream")?;

        let lifetime = self.inner.session.lifetime();
        let stream = tokio::select! {
            biased;
            opened = self.inner.session.open_bi() => opened?,
            _ = lifetime.cancelled() => return Err(Error::SessionClosed),
        };
        trace!(stream_id = %stream.id(), "opened request stream");
        Ok(RequestStream::new(stream, self.inner.conn_ref()))
    }

    /// Open a unidirectional stream of type `stream_type`
    ///
    /// Reserved types may be opened once per connection; the control stream
    /// is always taken.
    pub async fn open_typed_stream(
        &self,
        stream_type: StreamType,
    ) -> Result<WritableStream<S::SendStream>> {
        if !stream_type.is_valid() {
            return Err(Error::InvalidStreamType(stream_type));
        }
        self.inner.open_typed(stream_type).await
    }

    /// Wait for the peer to open a unidirectional stream of a
    /// non-reserved type
    pub async fn accept_typed_stream(&self) -> Result<ReadableStream<S::RecvStream>> {
        let lifetime = self.inner.session.lifetime();
        let mut incoming = self.inner.incoming_rx.lock().await;
        tokio::select! {
            biased;
            stream = incoming.recv() => stream.ok_or(Error::SessionClosed),
            _ = lifetime.cancelled() => Err(Error::SessionClosed),
        }
    }

    /// Close the connection with an application error code
    pub fn close(&self, code: ErrorCode, reason: &str) {
        self.inner.close_with(ConnError::msg(code, reason.to_string()));
    }

    fn require(&self, side: Perspective, operation: &'static str) -> Result<()> {
        if self.inner.perspective != side {
            return Err(Error::Perspective {
                operation,
                expected: side,
            });
        }
        Ok(())
    }
}

async fn default_settings<S: Session>(session: &S, config: &ConnectionConfig) -> Settings {
    let datagrams = match config.enable_datagrams {
        Some(enabled) => enabled,
        None => session.supports_datagrams().await,
    };

    let mut settings = Settings::new();
    if datagrams {
        settings.enable_datagrams();
    }
    settings
}

impl<S: Session> Inner<S> {
    fn conn_ref(self: &Arc<Self>) -> ConnRef {
        let weak: Weak<Self> = Arc::downgrade(self);
        weak
    }

    /// Open a unidirectional stream and write its type prefix
    async fn open_typed(
        self: &Arc<Self>,
        stream_type: StreamType,
    ) -> Result<WritableStream<S::SendStream>> {
        // Held across the open so two callers cannot both pass the check.
        let mut local = if stream_type.is_reserved() {
            let local = self.local_streams.lock().await;
            if local.is_claimed(stream_type) {
                return Err(Error::DuplicateStreamType(stream_type));
            }
            Some(local)
        } else {
            None
        };

        let mut stream = self.session.open_uni().await?;
        varint::write(&mut stream, stream_type.0).await?;
        if let Some(local) = local.as_mut() {
            local
                .claim(stream_type, stream.id())
                .map_err(|_| Error::DuplicateStreamType(stream_type))?;
        }

        trace!(stream_id = %stream.id(), %stream_type, "opened typed stream");
        Ok(WritableStream::new(stream, stream_type, self.conn_ref()))
    }

    async fn accept_uni_streams(self: Arc<Self>) {
        let lifetime = self.session.lifetime();
        let mut handlers = JoinSet::new();

        loop {
            while let Some(result) = handlers.try_join_next() {
                log_handler_exit(result);
            }

            let permit = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                permit = self.handler_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let stream = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                accepted = self.session.accept_uni() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        debug!(side = %self.perspective, error = %e, "stopped accepting unidirectional streams");
                        break;
                    }
                },
            };

            let conn = self.clone();
            handlers.spawn(conn.handle_uni_stream(stream, permit));
        }

        handlers.shutdown().await;
        trace!(side = %self.perspective, "unidirectional stream accept loop exited");
    }

    /// Classify one incoming stream
    ///
    /// `permit` bounds how many streams wait on their type prefix at once.
    /// It is released as soon as the type is known, so long-lived handlers
    /// such as the control stream reader never hold up the accept loop.
    async fn handle_uni_stream(
        self: Arc<Self>,
        mut stream: S::RecvStream,
        permit: OwnedSemaphorePermit,
    ) {
        let id = stream.id();
        let stream_type = match varint::read(&mut stream).await {
            Ok(t) => StreamType(t),
            Err(e) => {
                debug!(stream_id = %id, error = %e, "failed to read stream type");
                stream.stop_sending(ErrorCode::GENERAL_PROTOCOL_ERROR.into());
                return;
            }
        };
        drop(permit);
        trace!(side = %self.perspective, stream_id = %id, %stream_type, "incoming unidirectional stream");

        let stream = ReadableStream::new(stream, stream_type, self.conn_ref());
        match stream_type {
            StreamType::CONTROL => {
                if self.claim_peer_stream(stream_type, id, None).await {
                    self.handle_control_stream(stream).await;
                }
            }
            StreamType::PUSH => {
                if !self.claim_peer_stream(stream_type, id, None).await {
                    return;
                }
                // MAX_PUSH_ID is never sent, so no push stream is ever allowed.
                let err = match self.perspective {
                    Perspective::Server => ConnError::msg(
                        ErrorCode::STREAM_CREATION_ERROR,
                        format!("spurious {} from client", stream_type),
                    ),
                    Perspective::Client => ConnError::msg(
                        ErrorCode::ID_ERROR,
                        format!("unexpected {} without MAX_PUSH_ID", stream_type),
                    ),
                };
                self.close_with(err);
            }
            StreamType::QPACK_ENCODER | StreamType::QPACK_DECODER => {
                self.claim_peer_stream(stream_type, id, Some(stream)).await;
            }
            _ => {
                let lifetime = self.session.lifetime();
                tokio::select! {
                    biased;
                    _ = lifetime.cancelled() => {}
                    sent = self.incoming_tx.send(stream) => {
                        if sent.is_err() {
                            trace!(stream_id = %id, "incoming stream queue closed");
                        }
                    }
                }
            }
        }
    }

    /// Record the peer's stream of a reserved type, closing the connection
    /// if one was already opened
    async fn claim_peer_stream(
        &self,
        stream_type: StreamType,
        id: StreamId,
        parked: Option<ReadableStream<S::RecvStream>>,
    ) -> bool {
        let mut peer_streams = self.peer_streams.lock().await;
        let first = peer_streams.get(stream_type).map(|s| s.id);
        match peer_streams.claim(stream_type, PeerStream {
            id,
            _parked: parked,
        }) {
            Ok(()) => true,
            Err(_) => {
                drop(peer_streams);
                let first = first.map(|id| id.to_string()).unwrap_or_default();
                self.close_with(ConnError::msg(
                    ErrorCode::STREAM_CREATION_ERROR,
                    format!(
                        "more than one {} opened (stream {} after stream {})",
                        stream_type, id, first
                    ),
                ));
                false
            }
        }
    }

    async fn handle_control_stream(&self, mut stream: ReadableStream<S::RecvStream>) {
        let first = match frame::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(e) => {
                if !self.session.lifetime().is_cancelled() {
                    self.close_with(control_stream_error(e));
                }
                return;
            }
        };

        let settings = match first.into_settings() {
            Ok(settings) => settings,
            Err(e) => {
                self.close_with(ConnError::new(ErrorCode::MISSING_SETTINGS, e));
                return;
            }
        };

        // A peer announcing HTTP datagrams needs datagram support from the
        // transport as well.
        if settings.datagrams_enabled() && !self.session.supports_datagrams().await {
            self.close_with(ConnError::msg(
                ErrorCode::SETTINGS_ERROR,
                "missing QUIC datagram support",
            ));
            return;
        }

        info!(side = %self.perspective, peer_settings = %settings, "received peer SETTINGS");
        if self.peer_settings.set(Ok(settings)).is_err() {
            return;
        }

        self.read_control_frames(stream).await;
    }

    async fn read_control_frames(&self, mut stream: ReadableStream<S::RecvStream>) {
        loop {
            match frame::read_frame(&mut stream).await {
                Ok(Frame::Settings(_)) => {
                    self.close_with(ConnError::msg(
                        ErrorCode::FRAME_UNEXPECTED,
                        "second SETTINGS frame on control stream",
                    ));
                    return;
                }
                Ok(Frame::Unknown { frame_type, length }) => {
                    if is_request_frame(frame_type) {
                        self.close_with(ConnError::msg(
                            ErrorCode::FRAME_UNEXPECTED,
                            format!("{} on control stream", frame_type),
                        ));
                        return;
                    }
                    trace!(%frame_type, length, "ignoring frame on control stream");
                }
                Err(e) => {
                    if !self.session.lifetime().is_cancelled() {
                        self.close_with(control_stream_error(e));
                    }
                    return;
                }
            }
        }
    }
}

impl<S: Session> ConnHandle for Inner<S> {
    fn close_with(&self, err: ConnError) {
        if err.code == ErrorCode::NO_ERROR {
            debug!(side = %self.perspective, reason = %err.cause, "closing connection");
        } else {
            warn!(side = %self.perspective, code = %err.code, reason = %err.cause, "closing connection");
        }

        let code = err.code;
        let reason = err.reason();
        // Waiters on the peer settings see the error rather than a bare closure.
        let _ = self.peer_settings.set(Err(err));
        self.session.close_with_error(code.into(), &reason);
    }
}

fn control_stream_error(err: FrameError) -> ConnError {
    match err {
        FrameError::Eof => ConnError::msg(
            ErrorCode::CLOSED_CRITICAL_STREAM,
            "control stream closed by peer",
        ),
        other => ConnError::new(ErrorCode::FRAME_ERROR, other),
    }
}

/// Frames that belong on request or push streams only
fn is_request_frame(frame_type: FrameType) -> bool {
    matches!(
        frame_type,
        FrameType::DATA | FrameType::HEADERS | FrameType::PUSH_PROMISE
    )
}

fn log_handler_exit(result: std::result::Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            warn!(error = %e, "unidirectional stream handler panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::transport::MemorySession;

    #[tokio::test]
    async fn test_default_settings_mirror_transport() {
        let (client, _server) = MemorySession::pair(&MemoryConfig::default());
        let settings = default_settings(&client, &ConnectionConfig::default()).await;
        assert!(settings.datagrams_enabled());

        let config = MemoryConfig {
            datagrams: false,
            ..MemoryConfig::default()
        };
        let (client, _server) = MemorySession::pair(&config);
        let settings = default_settings(&client, &ConnectionConfig::default()).await;
        assert!(settings.is_empty());
    }

    #[tokio::test]
    async fn test_config_overrides_datagram_default() {
        let (client, _server) = MemorySession::pair(&MemoryConfig::default());
        let config = ConnectionConfig {
            enable_datagrams: Some(false),
            ..ConnectionConfig::default()
        };
        assert!(default_settings(&client, &config).await.is_empty());
    }

    #[test]
    fn test_control_stream_error_codes() {
        assert_eq!(
            control_stream_error(FrameError::Eof).code,
            ErrorCode::CLOSED_CRITICAL_STREAM
        );
        assert_eq!(
            control_stream_error(FrameError::Truncated).code,
            ErrorCode::FRAME_ERROR
        );
    }

    #[test]
    fn test_request_frames_not_allowed_on_control_stream() {
        assert!(is_request_frame(FrameType::DATA));
        assert!(is_request_frame(FrameType::HEADERS));
        assert!(is_request_frame(FrameType::PUSH_PROMISE));
        assert!(!is_request_frame(FrameType::GOAWAY));
        assert!(!is_request_frame(FrameType(0x21)));
    }

    #[tokio::test]
    async fn test_local_reserved_stream_opened_once() {
        let (client, _server) = MemorySession::pair(&MemoryConfig::default());
        let conn = Connection::open(client, None).await.unwrap();

        assert!(matches!(
            conn.open_typed_stream(StreamType::CONTROL).await,
            Err(Error::DuplicateStreamType(StreamType::CONTROL))
        ));

        let encoder = conn
            .open_typed_stream(StreamType::QPACK_ENCODER)
            .await
            .unwrap();
        assert_eq!(encoder.stream_type(), StreamType::QPACK_ENCODER);
        assert!(matches!(
            conn.open_typed_stream(StreamType::QPACK_ENCODER).await,
            Err(Error::DuplicateStreamType(_))
        ));

        assert!(matches!(
            conn.open_typed_stream(StreamType(0x21)).await,
            Err(Error::InvalidStreamType(_))
        ));
    }
}
