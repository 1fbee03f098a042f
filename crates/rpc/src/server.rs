//! RPC server: routes call envelopes to registered services.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use knot_network::frame::MAX_BODY_SIZE;
use knot_network::{
    CorrelationId, Handler, NetworkResult, ServerConfig, Session, SessionId, SessionTable,
    TcpServer,
};
use tracing::{debug, error, info, warn};

use crate::registry::{Registry, Service};

/// Collects services, then serves them over TCP.
#[derive(Debug, Default)]
pub struct RpcServer {
    registry: Registry,
    config: ServerConfig,
}

impl RpcServer {
    /// Create a server with the default connection settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a server with custom connection settings.
    #[must_use]
    pub fn with_config(config: ServerConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }

    /// Register a service. Registering a second service under the same name replaces the first.
    pub fn register<S: Service>(&mut self, receiver: S) -> &mut Self {
        self.registry.register(receiver);
        self
    }

    /// Start listening on `addr`. The registry is frozen from here on.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn start(self, addr: &str) -> NetworkResult<RunningRpcServer> {
        let sessions = SessionTable::new();
        let dispatcher = Arc::new(ServiceDispatcher {
            registry: self.registry,
            sessions: sessions.clone(),
        });
        let server = TcpServer::with_sessions(dispatcher, self.config, sessions);
        let local_addr = server.listen(addr).await?;
        info!(%local_addr, "rpc server started");

        Ok(RunningRpcServer { server, local_addr })
    }
}

/// Handle to a listening [`RpcServer`].
pub struct RunningRpcServer {
    server: TcpServer<ServiceDispatcher>,
    local_addr: SocketAddr,
}

impl RunningRpcServer {
    /// Address the server is bound to.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of connected clients.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.server.session_count()
    }

    /// Stop accepting connections and close every live session.
    pub fn shutdown(&self) {
        self.server.shutdown();
    }
}

struct ServiceDispatcher {
    registry: Registry,
    sessions: SessionTable,
}

#[async_trait]
impl Handler for ServiceDispatcher {
    async fn connect(&self, session_id: SessionId, _session: Arc<Session>) {
        debug!(session_id, "client connected");
    }

    async fn message(&self, session_id: SessionId, correlation_id: CorrelationId, body: Bytes) {
        let values = match self.registry.dispatch(&body) {
            Ok(values) => values,
            Err(e) => {
                warn!(session_id, correlation_id, error = %e, "dropping call");
                return;
            }
        };

        // Zero results still get an empty reply so the caller is released.
        let reply = if values.is_empty() {
            Bytes::new()
        } else {
            match serde_json::to_vec(&values) {
                Ok(encoded) => {
                    if encoded.len() > MAX_BODY_SIZE {
                        warn!(
                            session_id,
                            correlation_id,
                            size = encoded.len(),
                            max = MAX_BODY_SIZE,
                            "reply exceeds frame limit, caller will see an empty result"
                        );
                    }
                    Bytes::from(encoded)
                }
                Err(e) => {
                    error!(session_id, correlation_id, error = %e, "failed to encode reply");
                    return;
                }
            }
        };

        if let Err(e) = self.sessions.write(session_id, correlation_id, reply).await {
            debug!(session_id, correlation_id, error = %e, "reply not sent");
        }
    }

    async fn heartbeat(&self, session_id: SessionId, correlation_id: CorrelationId) {
        debug!(session_id, correlation_id, "client heartbeat");
    }

    async fn close(&self, session_id: SessionId) {
        debug!(session_id, "client disconnected");
    }
}
