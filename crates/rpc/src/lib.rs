//! Remote procedure calls over knot sessions.
//!
//! A call is a `DATA` frame whose body is a JSON array
//! `["Service.Method", arg1, arg2, ...]`. The server coerces the arguments to
//! the method's parameter types, invokes it and answers with a JSON array of
//! the results, or an empty body if the method returns nothing. Calls that
//! cannot be routed are logged and dropped, so the caller only sees a timeout.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod client;
pub mod error;
pub mod pending;
pub mod registry;
pub mod server;

pub use client::{DEFAULT_CALL_TIMEOUT, RpcClient, RpcClientConfig};
pub use error::{CallError, RpcError, RpcResult};
pub use pending::{CallResult, PendingCalls};
pub use registry::{
    Json, Method, MethodDescriptor, MethodTable, Param, ParamKind, Registry, Returns, Service,
};
pub use server::{RpcServer, RunningRpcServer};
