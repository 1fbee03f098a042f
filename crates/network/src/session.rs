//! A live, stateful wrapper around one connection.
//!
//! A session moves strictly forward through `NEW -> WORKING -> CLOSING -> CLOSED`.
//! [`Session::start`] launches a read pump and a write pump. The read pump
//! decodes frames into a capacity-1 inbound queue, the write pump drains a
//! capacity-1 outbound queue onto the connection. Both exit once the state
//! leaves `WORKING`. When the read pump exits it fires the session's close
//! signal exactly once; whoever owns the [`SessionFeed`] then calls
//! [`Session::release`].

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::{NetworkError, NetworkResult};
use crate::frame::{CorrelationId, Frame, FrameCodec, FrameKind};

/// Identity of a session.
pub type SessionId = u16;

/// Type alias for boxed futures
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Callback invoked for every `DATA` frame: `(session id, correlation id, body)`.
pub type MessageHandler = Arc<dyn Fn(SessionId, CorrelationId, Bytes) -> BoxedFuture<()> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`].
pub fn message_handler<F, Fut>(handler: F) -> MessageHandler
where
    F: Fn(SessionId, CorrelationId, Bytes) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |session_id, correlation_id, body| {
        Box::pin(handler(session_id, correlation_id, body)) as BoxedFuture<()>
    })
}

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    /// Session exists, pumps not started.
    New,
    /// Both pumps active, frames flow.
    Working,
    /// Pumps terminate on their next check.
    Closing,
    /// Queues closed, no further operations valid.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Working => "WORKING",
            Self::Closing => "CLOSING",
            Self::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// The receiving side of a session, consumed by its dispatch loop.
#[derive(Debug)]
pub struct SessionFeed {
    /// Decoded inbound frames (capacity 1).
    pub frames: mpsc::Receiver<Frame>,
    /// Fires once the read pump has stopped and the connection is closed.
    pub closed: oneshot::Receiver<()>,
}

/// Pump-side halves, held until `start`.
struct PumpIo {
    reader: BoxedReader,
    writer: BoxedWriter,
    inbound: mpsc::Sender<Frame>,
    outbound: mpsc::Receiver<Frame>,
    closed: oneshot::Sender<()>,
}

/// One live connection.
pub struct Session {
    id: SessionId,
    state: watch::Sender<SessionState>,
    pump_io: Mutex<Option<PumpIo>>,
    outbound: Mutex<Option<mpsc::Sender<Frame>>>,
    feed: Mutex<Option<SessionFeed>>,
    message_handler: RwLock<MessageHandler>,
    released: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Wrap `stream` in a new session in state `NEW`.
    ///
    /// The inbound feed is kept inside the session; see [`Session::take_feed`].
    pub fn new<S>(id: SessionId, stream: S, message_handler: MessageHandler) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (session, feed) = Self::open(id, stream, message_handler);
        *session.feed.lock() = Some(feed);
        session
    }

    /// Wrap `stream` in a new session in state `NEW`, handing the inbound
    /// feed straight to the caller.
    pub fn open<S>(
        id: SessionId,
        stream: S,
        message_handler: MessageHandler,
    ) -> (Arc<Self>, SessionFeed)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx) = mpsc::channel(1);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = oneshot::channel();

        let session = Arc::new(Self {
            id,
            state: watch::Sender::new(SessionState::New),
            pump_io: Mutex::new(Some(PumpIo {
                reader: Box::new(reader),
                writer: Box::new(writer),
                inbound: inbound_tx,
                outbound: outbound_rx,
                closed: closed_tx,
            })),
            outbound: Mutex::new(Some(outbound_tx)),
            feed: Mutex::new(None),
            message_handler: RwLock::new(message_handler),
            released: AtomicBool::new(false),
        });

        let feed = SessionFeed {
            frames: inbound_rx,
            closed: closed_rx,
        };
        (session, feed)
    }

    /// Session id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch the session's state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Resolves once the session has reached at least `state`.
    pub async fn reached(&self, state: SessionState) {
        let mut rx = self.state.subscribe();
        // Err only if the sender is gone, which cannot happen while `self` lives.
        let _ = rx.wait_for(|current| *current >= state).await;
    }

    /// Move to `to` if that is a forward transition.
    fn advance(&self, to: SessionState) -> bool {
        self.state.send_if_modified(|state| {
            if to > *state {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Transition to `WORKING` and launch the read and write pumps.
    ///
    /// # Errors
    ///
    /// Returns an error if the pumps were already started, or if the session
    /// was closed before it was started.
    pub fn start(&self) -> NetworkResult<()> {
        let io = self
            .pump_io
            .lock()
            .take()
            .ok_or(NetworkError::AlreadyStarted(self.id))?;

        if !self.advance(SessionState::Working) {
            return Err(NetworkError::NotWorking {
                id: self.id,
                state: self.state(),
            });
        }

        let id = self.id;
        let disconnected = CancellationToken::new();

        let reader = FramedRead::new(io.reader, FrameCodec);
        let read_state = self.state.subscribe();
        let read_disconnected = disconnected.clone();
        let closed = io.closed;
        let inbound = io.inbound;
        tokio::spawn(async move {
            let pump = AssertUnwindSafe(read_pump(id, reader, inbound, read_state)).catch_unwind();
            if let Err(panic) = pump.await {
                error!(
                    session_id = id,
                    panic = %panic_message(panic.as_ref()),
                    backtrace = %Backtrace::force_capture(),
                    "read pump panicked"
                );
            }
            // Reader is gone; take the write half down with it.
            read_disconnected.cancel();
            let _ = closed.send(());
        });

        let writer = FramedWrite::new(io.writer, FrameCodec);
        let write_state = self.state.subscribe();
        tokio::spawn(write_pump(id, writer, io.outbound, write_state, disconnected));

        debug!(session_id = id, "session started");
        Ok(())
    }

    /// Mark the session `CLOSING`. Both pumps stop on their next check.
    pub fn close(&self) {
        if self.advance(SessionState::Closing) {
            debug!(session_id = self.id, "session closing");
        }
    }

    /// Release the session's queues and mark it `CLOSED`.
    ///
    /// Must be called exactly once, after the close signal fired.
    ///
    /// # Panics
    ///
    /// Panics if the session was already released.
    pub fn release(&self) {
        assert!(
            !self.released.swap(true, Ordering::AcqRel),
            "session {} released twice",
            self.id
        );

        self.close();
        self.outbound.lock().take();
        self.feed.lock().take();
        self.pump_io.lock().take();
        self.advance(SessionState::Closed);
        debug!(session_id = self.id, "session released");
    }

    /// Take the inbound feed. Only the first caller gets it.
    pub fn take_feed(&self) -> Option<SessionFeed> {
        self.feed.lock().take()
    }

    /// Replace the callback that handles `DATA` frames.
    pub fn forward(&self, message_handler: MessageHandler) {
        *self.message_handler.write() = message_handler;
    }

    /// The callback that handles `DATA` frames.
    #[must_use]
    pub fn message_handler(&self) -> MessageHandler {
        Arc::clone(&self.message_handler.read())
    }

    /// Queue a frame for the write pump, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// A frame offered outside `WORKING` is logged and dropped with
    /// [`NetworkError::NotWorking`]. If the write pump already stopped the
    /// frame is dropped with [`NetworkError::Disconnected`].
    pub async fn send(
        &self,
        correlation_id: CorrelationId,
        kind: FrameKind,
        body: impl Into<Bytes>,
    ) -> NetworkResult<()> {
        let state = self.state();
        if state != SessionState::Working {
            error!(
                session_id = self.id,
                correlation_id,
                %kind,
                %state,
                "session not working, frame not sent"
            );
            return Err(NetworkError::NotWorking { id: self.id, state });
        }

        let Some(outbound) = self.outbound.lock().clone() else {
            return Err(NetworkError::Disconnected(self.id));
        };

        outbound
            .send(Frame::new(correlation_id, kind, body))
            .await
            .map_err(|_| {
                debug!(session_id = self.id, correlation_id, "write pump gone, frame dropped");
                NetworkError::Disconnected(self.id)
            })
    }
}

async fn read_pump(
    id: SessionId,
    mut frames: FramedRead<BoxedReader, FrameCodec>,
    inbound: mpsc::Sender<Frame>,
    mut state: watch::Receiver<SessionState>,
) {
    loop {
        let next = tokio::select! {
            _ = state.wait_for(|s| *s != SessionState::Working) => break,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                tokio::select! {
                    _ = state.wait_for(|s| *s != SessionState::Working) => break,
                    sent = inbound.send(frame) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                debug!(session_id = id, error = %e, "connection closed mid-frame");
                break;
            }
            Some(Err(e)) => {
                error!(session_id = id, error = %e, "failed to read frame");
                break;
            }
            None => {
                debug!(session_id = id, "connection closed by peer");
                break;
            }
        }
    }
}

async fn write_pump(
    id: SessionId,
    mut sink: FramedWrite<BoxedWriter, FrameCodec>,
    mut outbound: mpsc::Receiver<Frame>,
    mut state: watch::Receiver<SessionState>,
    disconnected: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = state.wait_for(|s| *s != SessionState::Working) => break,
            () = disconnected.cancelled() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        if let Err(e) = sink.send(frame).await {
            error!(session_id = id, error = %e, "failed to write frame");
            break;
        }
    }

    if let Err(e) = sink.close().await {
        debug!(session_id = id, error = %e, "failed to shut down connection");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
