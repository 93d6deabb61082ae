//! Typed failures surfaced to callers of the core.
//!
//! Raw backend protocol errors never escape as-is: they are folded into
//! [`Error::BackendRejected`], with the original payload kept only as an
//! attached diagnostic.

use std::time::Duration;

use crate::registry::Capability;
use crate::rpc::RpcError;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel to the backend was already closed when the call was made.
    #[error("transport to agent process is closed")]
    TransportClosed,

    #[error("handshake with agent failed: {0}")]
    HandshakeFailed(String),

    #[error("request {method:?} timed out after {after:?}")]
    TimedOut { method: String, after: Duration },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend answered with a protocol-level error.
    #[error("agent rejected request: {message} (code {code})")]
    BackendRejected {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The backend went away while an operation was waiting on it.
    #[error("agent process disconnected{}", exit_suffix(.exit_status))]
    BackendDisconnected { exit_status: Option<i32> },

    #[error("agent is not ready: {0}")]
    NotReady(String),

    #[error("agent {agent:?} does not support {capability}")]
    CapabilityUnsupported {
        agent: String,
        capability: Capability,
    },

    #[error("agent id {0:?} is already registered as a built-in")]
    PluginIdConflict(String),

    #[error("agent id {0:?} is already registered")]
    DuplicateAgent(String),

    #[error("unknown agent {0:?}")]
    UnknownAgent(String),

    #[error("failed to spawn {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

fn exit_suffix(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!(" (exit status {code})"),
        None => String::new(),
    }
}

impl Error {
    /// Whether a surface should retry by acquiring a fresh session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed | Error::BackendDisconnected { .. }
        )
    }

    pub(crate) fn unsupported(agent: &str, capability: Capability) -> Self {
        Error::CapabilityUnsupported {
            agent: agent.to_string(),
            capability,
        }
    }

    /// Build an error for a response that did not have the expected shape.
    pub(crate) fn malformed(method: &str, what: &str) -> Self {
        Error::BackendRejected {
            code: -32603,
            message: format!("{method} response is missing {what}"),
            data: None,
        }
    }
}

impl From<RpcError> for Error {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Closed => Error::TransportClosed,
            RpcError::Disconnected { exit_status } => Error::BackendDisconnected { exit_status },
            RpcError::TimedOut { method, after } => Error::TimedOut { method, after },
            RpcError::Rejected(obj) => Error::BackendRejected {
                code: obj.code,
                message: obj.message,
                data: obj.data,
            },
            RpcError::Encode(e) => Error::InvalidArgument(format!("unserializable params: {e}")),
        }
    }
}
