//! RPC client: correlated calls with a timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use knot_network::{
    ClientConfig, CorrelationId, Handler, NetworkResult, Session, SessionId, TcpClient,
};
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::pending::{CallResult, PendingCalls};

/// Default time a call waits for its response.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Configuration for [`RpcClient`].
#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    /// Connection and heartbeat settings.
    pub network: ClientConfig,
    /// Time a call waits for its response.
    pub call_timeout: Duration,
}

impl Default for RpcClientConfig {
    fn default() -> Self {
        Self {
            network: ClientConfig::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

impl RpcClientConfig {
    /// Set the connection settings.
    #[must_use]
    pub fn with_network(mut self, network: ClientConfig) -> Self {
        self.network = network;
        self
    }

    /// Set the call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}

/// A connection to an [`crate::RpcServer`].
#[derive(Debug)]
pub struct RpcClient {
    client: TcpClient,
    pending: Arc<PendingCalls>,
    call_timeout: Duration,
}

impl RpcClient {
    /// Connect to `addr` with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn dial(addr: &str) -> NetworkResult<Self> {
        Self::dial_with_config(addr, RpcClientConfig::default()).await
    }

    /// Connect to `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn dial_with_config(addr: &str, config: RpcClientConfig) -> NetworkResult<Self> {
        let pending = Arc::new(PendingCalls::new());
        let router = Arc::new(ResponseRouter {
            pending: Arc::clone(&pending),
        });
        let client = TcpClient::dial(addr, router, config.network).await?;

        Ok(Self {
            client,
            pending,
            call_timeout: config.call_timeout,
        })
    }

    /// Call a remote method and wait for its results.
    ///
    /// `args` is the whole envelope: `["Service.Method", arg1, arg2, ...]`.
    ///
    /// A method with no results resolves to an empty `Vec`. So does a method
    /// whose encoded results exceed the frame body limit, since the server
    /// sends an empty body in its place; the two cannot be told apart here.
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Timeout`] if no response arrives in time, which is
    /// also what an unknown method or a bad argument looks like from here.
    /// Returns [`CallError::Closed`] if the client is closed while waiting.
    pub async fn call(&self, args: Vec<Value>) -> CallResult {
        let body = serde_json::to_vec(&args).map_err(CallError::Encode)?;
        let correlation_id = self.client.next_correlation_id();
        let waiter = self.pending.insert(correlation_id);

        if let Err(e) = self.client.write(correlation_id, body).await {
            self.pending.cancel(correlation_id);
            return Err(e.into());
        }

        match timeout(self.call_timeout, waiter).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CallError::Closed),
            Err(_) => {
                self.pending.cancel(correlation_id);
                warn!(
                    correlation_id,
                    timeout = ?self.call_timeout,
                    "call timed out"
                );
                Err(CallError::Timeout(self.call_timeout))
            }
        }
    }

    /// Send a call without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be encoded or sent.
    pub async fn send(&self, args: Vec<Value>) -> Result<(), CallError> {
        let body = serde_json::to_vec(&args).map_err(CallError::Encode)?;
        let correlation_id = self.client.write_data(body).await?;
        debug!(correlation_id, "sent one-way call");
        Ok(())
    }

    /// Fail every outstanding call and close the connection.
    pub fn close(&self) {
        let drained = self.pending.drain();
        debug!(session_id = self.session_id(), drained, "closing rpc client");
        self.client.close();
    }

    /// Resolves once the connection has been released.
    pub async fn closed(&self) {
        self.client.closed().await;
    }

    /// Id of the underlying session.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.client.session_id()
    }

    /// Number of calls waiting for a response.
    #[must_use]
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }
}

struct ResponseRouter {
    pending: Arc<PendingCalls>,
}

#[async_trait]
impl Handler for ResponseRouter {
    async fn connect(&self, session_id: SessionId, _session: Arc<Session>) {
        debug!(session_id, "rpc client connected");
    }

    async fn message(&self, session_id: SessionId, correlation_id: CorrelationId, body: Bytes) {
        if !self.pending.resolve(correlation_id, &body) {
            debug!(session_id, correlation_id, "response without a pending call");
        }
    }

    async fn close(&self, session_id: SessionId) {
        let drained = self.pending.drain();
        if drained > 0 {
            warn!(session_id, drained, "connection lost with calls in flight");
        }
    }
}
