//! Error types for the RPC layer.

use std::time::Duration;

use knot_network::NetworkError;
use thiserror::Error;

use crate::registry::ParamKind;

/// Result type alias for server-side dispatch.
pub type RpcResult<T> = Result<T, RpcError>;

/// Why an inbound call envelope was not dispatched.
///
/// These never travel back to the caller; the server logs them and drops the frame.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The body is not a JSON array.
    #[error("Malformed envelope: {0}")]
    MalformedJson(#[from] serde_json::Error),

    /// The envelope array has no elements.
    #[error("Empty envelope")]
    EmptyEnvelope,

    /// The first element of the envelope is not a string.
    #[error("Method reference is not a string: {0}")]
    MethodNotString(serde_json::Value),

    /// The method reference has no `.` separator.
    #[error("Method reference {0:?} has no '.' separator")]
    MissingSeparator(String),

    /// No service is registered under this name.
    #[error("Unknown service: {0}")]
    UnknownService(String),

    /// The service has no method with this name.
    #[error("Unknown method {method} on service {service}")]
    UnknownMethod {
        /// Service name.
        service: String,
        /// Method name.
        method: String,
    },

    /// Fewer arguments than the method declares.
    #[error("Missing argument {index} ({expected})")]
    MissingArgument {
        /// Zero-based argument position.
        index: usize,
        /// Declared parameter kind.
        expected: ParamKind,
    },

    /// An argument does not convert to its declared kind.
    #[error("Argument {index} does not convert to {expected}: {value}")]
    ArgumentMismatch {
        /// Zero-based argument position.
        index: usize,
        /// Declared parameter kind.
        expected: ParamKind,
        /// The value that was passed.
        value: serde_json::Value,
    },

    /// A method result could not be encoded as JSON.
    #[error("Failed to encode result: {0}")]
    ResultEncoding(serde_json::Error),
}

/// Why a client call produced no response.
#[derive(Debug, Error)]
pub enum CallError {
    /// No response arrived in time.
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),

    /// The waiter was closed without a response, e.g. by [`crate::RpcClient::close`].
    #[error("Call cancelled before a response arrived")]
    Closed,

    /// The response body is not a JSON array.
    #[error("Malformed response: {0}")]
    MalformedResponse(#[source] serde_json::Error),

    /// The call arguments could not be encoded.
    #[error("Failed to encode arguments: {0}")]
    Encode(#[source] serde_json::Error),

    /// The request could not be sent.
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),
}
