//! Client side connection manager.

use std::sync::Arc;

use bytes::Bytes;
use knot_util::IdGenerator;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, MissedHeartbeatPolicy};
use crate::dispatch::Dispatcher;
use crate::error::{NetworkError, NetworkResult};
use crate::frame::{CorrelationId, Frame, FrameKind};
use crate::handler::{Handler, forward_to};
use crate::session::{Session, SessionFeed, SessionId, SessionState};

/// One outbound TCP connection with heartbeat keep-alive.
///
/// Dropping the client closes its session.
pub struct TcpClient {
    session: Arc<Session>,
    correlation_ids: Arc<IdGenerator>,
}

impl std::fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpClient")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl TcpClient {
    /// Connect to `addr`, start the session and its heartbeat.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn dial<H: Handler>(
        addr: &str,
        handler: Arc<H>,
        config: ClientConfig,
    ) -> NetworkResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| NetworkError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let id = config.session_ids.next_id();
        let (session, feed) = Session::open(id, stream, forward_to(&handler));
        session.start()?;
        info!(session_id = id, %addr, "connected");

        handler.connect(id, Arc::clone(&session)).await;

        let correlation_ids = Arc::new(IdGenerator::new());
        let (acks_tx, acks_rx) = mpsc::channel(1);
        let activity = Arc::new(Notify::new());

        let dispatch = ClientDispatch {
            handler,
            session: Arc::clone(&session),
            dispatcher: Dispatcher::new(config.dispatch),
            acks: acks_tx,
            activity: Arc::clone(&activity),
        };
        tokio::spawn(dispatch.run(feed));

        tokio::spawn(heartbeat(
            Arc::clone(&session),
            Arc::clone(&correlation_ids),
            acks_rx,
            activity,
            config,
        ));

        Ok(Self {
            session,
            correlation_ids,
        })
    }

    /// The connection's session.
    #[must_use]
    pub const fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Id of the connection's session.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }

    /// Next correlation id. Heartbeats draw from the same counter.
    #[must_use]
    pub fn next_correlation_id(&self) -> CorrelationId {
        self.correlation_ids.next_id()
    }

    /// Send a `DATA` frame with the given correlation id.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot take the frame.
    pub async fn write(
        &self,
        correlation_id: CorrelationId,
        body: impl Into<Bytes>,
    ) -> NetworkResult<()> {
        self.session
            .send(correlation_id, FrameKind::Data, body)
            .await
    }

    /// Send a `DATA` frame under a fresh correlation id and return that id.
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot take the frame.
    pub async fn write_data(&self, body: impl Into<Bytes>) -> NetworkResult<CorrelationId> {
        let correlation_id = self.next_correlation_id();
        self.write(correlation_id, body).await?;
        Ok(correlation_id)
    }

    /// Close the connection. Resolves immediately; see [`TcpClient::closed`].
    pub fn close(&self) {
        self.session.close();
    }

    /// Resolves once the session has been released.
    pub async fn closed(&self) {
        self.session.reached(SessionState::Closed).await;
    }
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        self.session.close();
    }
}

struct ClientDispatch<H: Handler> {
    handler: Arc<H>,
    session: Arc<Session>,
    dispatcher: Dispatcher,
    acks: mpsc::Sender<CorrelationId>,
    activity: Arc<Notify>,
}

impl<H: Handler> ClientDispatch<H> {
    async fn run(self, mut feed: SessionFeed) {
        let id = self.session.id();
        loop {
            // Frames already queued are delivered before the close signal.
            tokio::select! {
                biased;
                Some(frame) = feed.frames.recv() => {
                    self.activity.notify_one();
                    self.route(frame).await;
                }
                _ = &mut feed.closed => break,
            }
        }

        self.handler.close(id).await;
        self.session.release();
        info!(session_id = id, "disconnected");
    }

    async fn route(&self, frame: Frame) {
        let id = self.session.id();
        let correlation_id = frame.correlation_id;

        match frame.kind {
            FrameKind::HeartbeatAck => {
                // A late ack is dropped if the previous one was never collected.
                let _ = self.acks.try_send(correlation_id);
            }
            FrameKind::Data => {
                let message_handler = self.session.message_handler();
                self.dispatcher
                    .spawn(message_handler(id, correlation_id, frame.body))
                    .await;
            }
            FrameKind::Plain | FrameKind::Heartbeat => {
                debug!(session_id = id, correlation_id, kind = %frame.kind, "ignoring frame");
            }
        }
    }
}

async fn heartbeat(
    session: Arc<Session>,
    correlation_ids: Arc<IdGenerator>,
    mut acks: mpsc::Receiver<CorrelationId>,
    activity: Arc<Notify>,
    config: ClientConfig,
) {
    let id = session.id();
    let mut state = session.subscribe();

    loop {
        tokio::select! {
            _ = state.wait_for(|s| *s != SessionState::Working) => break,
            () = activity.notified() => continue,
            () = sleep(config.heartbeat_interval) => {}
        }

        while acks.try_recv().is_ok() {}

        let correlation_id = correlation_ids.next_id();
        if session
            .send(correlation_id, FrameKind::Heartbeat, Bytes::new())
            .await
            .is_err()
        {
            break;
        }
        debug!(session_id = id, correlation_id, "heartbeat sent");

        match timeout(config.heartbeat_timeout, acks.recv()).await {
            Ok(Some(acked)) => {
                debug!(session_id = id, correlation_id = acked, "heartbeat acknowledged");
            }
            Ok(None) => break,
            Err(_) => {
                warn!(
                    session_id = id,
                    correlation_id,
                    timeout = ?config.heartbeat_timeout,
                    "heartbeat not acknowledged"
                );
                if config.missed_heartbeat == MissedHeartbeatPolicy::Disconnect {
                    session.close();
                    break;
                }
            }
        }
    }

    debug!(session_id = id, "heartbeat stopped");
}
