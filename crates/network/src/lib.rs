//! Connection and session layer for knot.
//!
//! Frames travel over TCP with a 5 byte little-endian header (see [`frame`]).
//! Each connection is wrapped in a [`Session`] that runs a read pump and a
//! write pump. [`TcpServer`] and [`TcpClient`] manage sessions on either side
//! and raise [`Handler`] events; the client also keeps the connection alive
//! with heartbeats.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod client;
pub mod config;
mod dispatch;
pub mod error;
pub mod frame;
pub mod handler;
pub mod server;
pub mod session;

pub use client::TcpClient;
pub use config::{ClientConfig, DispatchPolicy, MissedHeartbeatPolicy, ServerConfig};
pub use error::{NetworkError, NetworkResult, ProtocolError};
pub use frame::{CorrelationId, Frame, FrameCodec, FrameKind};
pub use handler::{Handler, forward_to};
pub use server::{SessionTable, TcpServer};
pub use session::{
    BoxedFuture, MessageHandler, Session, SessionFeed, SessionId, SessionState, message_handler,
};
