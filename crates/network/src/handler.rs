//! Connection event handler contract.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::frame::CorrelationId;
use crate::session::{MessageHandler, Session, SessionId, message_handler};

/// Events raised by the connection managers.
///
/// `message` and `heartbeat` run on their own tasks, so several may be in
/// flight for one session at the same time.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// A session was started.
    async fn connect(&self, session_id: SessionId, session: Arc<Session>);

    /// A `DATA` frame arrived.
    async fn message(&self, session_id: SessionId, correlation_id: CorrelationId, body: Bytes);

    /// A `HEARTBEAT` frame arrived on a working session.
    async fn heartbeat(&self, _session_id: SessionId, _correlation_id: CorrelationId) {}

    /// The session's connection is gone. Raised once, before the session is released.
    async fn close(&self, session_id: SessionId);
}

/// Route a session's `DATA` frames to [`Handler::message`].
pub fn forward_to<H: Handler>(handler: &Arc<H>) -> MessageHandler {
    let handler = Arc::clone(handler);
    message_handler(move |session_id, correlation_id, body| {
        let handler = Arc::clone(&handler);
        async move { handler.message(session_id, correlation_id, body).await }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::sync::mpsc;

    struct Recorder {
        messages: mpsc::UnboundedSender<(SessionId, CorrelationId, Bytes)>,
    }

    #[async_trait]
    impl Handler for Recorder {
        async fn connect(&self, _session_id: SessionId, _session: Arc<Session>) {}

        async fn message(&self, session_id: SessionId, correlation_id: CorrelationId, body: Bytes) {
            let _ = self.messages.send((session_id, correlation_id, body));
        }

        async fn close(&self, _session_id: SessionId) {}
    }

    #[tokio::test]
    async fn test_forward_to_calls_message() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Recorder { messages: tx });

        let callback = forward_to(&handler);
        callback(4, 17, Bytes::from_static(b"body")).await;

        assert_eq!(rx.recv().await.unwrap(), (4, 17, Bytes::from_static(b"body")));
    }

    #[tokio::test]
    async fn test_heartbeat_defaults_to_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let handler = Recorder { messages: tx };
        handler.heartbeat(1, 2).await;
    }
}
