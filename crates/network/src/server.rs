//! Server side connection manager.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{NetworkError, NetworkResult};
use crate::frame::{CorrelationId, Frame, FrameKind};
use crate::handler::{Handler, forward_to};
use crate::session::{Session, SessionFeed, SessionId, SessionState};

/// Live sessions of a [`TcpServer`], by id.
///
/// Cheap to clone; clones share the same table. A handler that needs to reply
/// on a session can be handed a clone before the server exists.
#[derive(Debug, Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Live session by id.
    #[must_use]
    pub fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions
            .get(&session_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Send a `DATA` frame on a live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or cannot take the frame.
    pub async fn write(
        &self,
        session_id: SessionId,
        correlation_id: CorrelationId,
        body: impl Into<Bytes>,
    ) -> NetworkResult<()> {
        let session = self
            .get(session_id)
            .ok_or(NetworkError::UnknownSession(session_id))?;
        session.send(correlation_id, FrameKind::Data, body).await
    }

    fn insert(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
    }

    fn remove(&self, session_id: SessionId) {
        self.sessions.remove(&session_id);
    }

    fn close_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().close();
        }
    }
}

/// Accepts TCP connections and runs one session per connection.
pub struct TcpServer<H: Handler> {
    inner: Arc<ServerInner<H>>,
}

struct ServerInner<H: Handler> {
    handler: Arc<H>,
    config: ServerConfig,
    dispatcher: Dispatcher,
    sessions: SessionTable,
    shutdown: CancellationToken,
}

impl<H: Handler> TcpServer<H> {
    /// Create a server that raises connection events on `handler`.
    pub fn new(handler: Arc<H>, config: ServerConfig) -> Self {
        Self::with_sessions(handler, config, SessionTable::new())
    }

    /// Create a server that records its live sessions in `sessions`.
    pub fn with_sessions(handler: Arc<H>, config: ServerConfig, sessions: SessionTable) -> Self {
        let dispatcher = Dispatcher::new(config.dispatch);
        Self {
            inner: Arc::new(ServerInner {
                handler,
                config,
                dispatcher,
                sessions,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Bind `addr` and accept connections in the background.
    ///
    /// Returns the bound address, which differs from `addr` when port 0 was requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn listen(&self, addr: &str) -> NetworkResult<SocketAddr> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| NetworkError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.shutdown.cancelled() => {
                        debug!(%local_addr, "listener shutting down");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "accepted connection");
                            tokio::spawn(Arc::clone(&inner).serve(stream));
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    },
                }
            }
        });

        Ok(local_addr)
    }

    /// The table of live sessions.
    #[must_use]
    pub fn sessions(&self) -> &SessionTable {
        &self.inner.sessions
    }

    /// Live session by id.
    #[must_use]
    pub fn session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.get(session_id)
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Send a `DATA` frame on a live session.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is unknown or cannot take the frame.
    pub async fn write(
        &self,
        session_id: SessionId,
        correlation_id: CorrelationId,
        body: impl Into<Bytes>,
    ) -> NetworkResult<()> {
        self.inner
            .sessions
            .write(session_id, correlation_id, body)
            .await
    }

    /// Stop accepting connections and close every live session.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.sessions.close_all();
        info!("server shut down");
    }
}

impl<H: Handler> ServerInner<H> {
    async fn serve(self: Arc<Self>, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let id = self.config.session_ids.next_id();
        let (session, feed) = Session::open(id, stream, forward_to(&self.handler));
        if let Err(e) = session.start() {
            error!(session_id = id, error = %e, "failed to start session");
            session.release();
            return;
        }
        self.sessions.insert(Arc::clone(&session));

        self.handler.connect(id, Arc::clone(&session)).await;
        self.dispatch(session, feed).await;
    }

    async fn dispatch(&self, session: Arc<Session>, mut feed: SessionFeed) {
        let id = session.id();
        loop {
            // Frames already queued are delivered before the close signal.
            tokio::select! {
                biased;
                Some(frame) = feed.frames.recv() => self.route(&session, frame).await,
                _ = &mut feed.closed => break,
            }
        }

        self.handler.close(id).await;
        self.sessions.remove(id);
        session.release();
    }

    async fn route(&self, session: &Arc<Session>, frame: Frame) {
        let id = session.id();
        let correlation_id = frame.correlation_id;

        match frame.kind {
            FrameKind::Heartbeat => {
                if session.state() != SessionState::Working {
                    return;
                }
                debug!(session_id = id, correlation_id, "heartbeat");

                let ack = Arc::clone(session);
                tokio::spawn(async move {
                    let _ = ack
                        .send(correlation_id, FrameKind::HeartbeatAck, Bytes::new())
                        .await;
                });

                let handler = Arc::clone(&self.handler);
                self.dispatcher
                    .spawn(async move { handler.heartbeat(id, correlation_id).await })
                    .await;
            }
            FrameKind::Data => {
                let message_handler = session.message_handler();
                self.dispatcher
                    .spawn(message_handler(id, correlation_id, frame.body))
                    .await;
            }
            FrameKind::Plain | FrameKind::HeartbeatAck => {
                debug!(session_id = id, correlation_id, kind = %frame.kind, "ignoring frame");
            }
        }
    }
}
