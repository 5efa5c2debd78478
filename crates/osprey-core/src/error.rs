//! Error types for osprey-core.

use crate::storage::StorageError;

// ==============================================================================
// RPC Errors
// ==============================================================================

/// Node error codes that must never be retried: the node has given a
/// definitive answer (unknown method, bad parameters, or the requested
/// transaction/block does not exist).
const TERMINAL_NODE_CODES: [i64; 4] = [-5, -8, -32601, -32602];

/// Structured errors from the chain JSON-RPC layer.
///
/// Each variant captures a specific failure mode rather than collapsing
/// everything into a single `String`, which is what lets the retry policy
/// distinguish transient transport failures from definitive node answers.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Connection refused, DNS failure, timeout: anything below HTTP.
    #[error("HTTP transport: {0}")]
    Transport(#[source] reqwest::Error),

    /// The endpoint answered, but not with a JSON-RPC body (proxies,
    /// auth failures, overload pages).
    #[error("HTTP status {status}")]
    Http { status: u16 },

    /// The node returned a structured JSON-RPC error object.
    #[error("node error: code={code}, message={message}")]
    Node { code: i64, message: String },

    #[error("invalid JSON-RPC response: {0}")]
    InvalidResponse(String),
}

impl RpcError {
    /// Whether the retry loop should attempt this call again.
    ///
    /// Transport failures and 5xx responses are transient. Node errors are
    /// retried unless the code is in the terminal set; `InvalidResponse`
    /// means the endpoint is not speaking JSON-RPC and retrying cannot help.
    pub fn is_retryable(&self) -> bool {
        match self {
            RpcError::Transport(_) => true,
            RpcError::Http { status } => *status >= 500,
            RpcError::Node { code, .. } => !TERMINAL_NODE_CODES.contains(code),
            RpcError::InvalidResponse(_) => false,
        }
    }

    /// The Bitcoin-family "invalid address or key / no such transaction"
    /// code, shared by both chain surfaces.
    pub fn is_not_found(&self) -> bool {
        matches!(self, RpcError::Node { code: -5, .. })
    }
}

// ==============================================================================
// Core Errors
// ==============================================================================

/// Top-level error type for the osprey-core crate.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("transaction not found: {0}")]
    TxNotFound(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("invalid chain data: {0}")]
    InvalidData(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("event stream: {0}")]
    Stream(String),

    /// Fatal startup failure; the monitor refuses to start.
    #[error("startup: {0}")]
    Startup(String),
}

impl CoreError {
    /// Whether the underlying RPC failure may succeed on a later attempt.
    /// Non-RPC errors are never retryable at the call layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Rpc(rpc) if rpc.is_retryable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_not_found_is_terminal() {
        let err = RpcError::Node {
            code: -5,
            message: "No such mempool or blockchain transaction".into(),
        };
        assert!(!err.is_retryable());
        assert!(err.is_not_found());
    }

    #[test]
    fn method_not_found_is_terminal() {
        let err = RpcError::Node {
            code: -32601,
            message: "Method not found".into(),
        };
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
    }

    #[test]
    fn internal_node_error_is_retryable() {
        let err = RpcError::Node {
            code: -32603,
            message: "Internal error".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn http_5xx_is_retryable_4xx_is_not() {
        assert!(RpcError::Http { status: 503 }.is_retryable());
        assert!(!RpcError::Http { status: 401 }.is_retryable());
    }

    #[test]
    fn invalid_response_is_terminal() {
        assert!(!RpcError::InvalidResponse("not json".into()).is_retryable());
    }
}
