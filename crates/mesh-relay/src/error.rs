// Numan Thabit 2025
//! Client-facing error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codes::{self, MESH_CODESPACE};
use crate::protocol::Dispatch;

/// Coarse classification reported to clients as `error.kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedRelay,
    UnknownServicer,
    NodeUnhealthy,
    SessionPending,
    SessionInvalid,
    SessionExhausted,
    OutOfSync,
    ChainNotHosted,
    ChainCallFailure,
    SigningFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::MalformedRelay => "MalformedRelay",
            ErrorKind::UnknownServicer => "UnknownServicer",
            ErrorKind::NodeUnhealthy => "NodeUnhealthy",
            ErrorKind::SessionPending => "SessionPending",
            ErrorKind::SessionInvalid => "SessionInvalid",
            ErrorKind::SessionExhausted => "SessionExhausted",
            ErrorKind::OutOfSync => "OutOfSync",
            ErrorKind::ChainNotHosted => "ChainNotHosted",
            ErrorKind::ChainCallFailure => "ChainCallFailure",
            ErrorKind::SigningFailure => "SigningFailure",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error object as emitted by servicer nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicerError {
    pub code: u32,
    #[serde(default)]
    pub codespace: String,
    #[serde(default)]
    pub message: String,
}

impl fmt::Display for ServicerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}: {}", self.codespace, self.code, self.message)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RelayError {
    #[error("malformed relay: {0}")]
    Malformed(String),
    #[error("servicer {0} is not loaded")]
    UnknownServicer(String),
    #[error("node {node} is not healthy: {reason}")]
    NodeUnhealthy { node: String, reason: String },
    #[error("session for servicer {servicer} is pending validation")]
    SessionPending { servicer: String },
    #[error("session rejected by servicer: {0}")]
    SessionInvalid(ServicerError),
    #[error("session has no remaining relays")]
    SessionExhausted,
    #[error(
        "relay session height {relay_height} is out of sync with node session height {node_height}"
    )]
    OutOfSync {
        relay_height: u64,
        node_height: u64,
        suspicious: bool,
    },
    #[error("chain {0} is not hosted")]
    ChainNotHosted(String),
    #[error("chain call failed: {message}")]
    ChainCallFailure {
        status: Option<u16>,
        message: String,
    },
    #[error("failed to sign relay response: {0}")]
    Signing(String),
    #[error("{0}")]
    Internal(String),
}

impl RelayError {
    pub fn malformed(message: impl Into<String>) -> Self {
        RelayError::Malformed(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        RelayError::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::Malformed(_) => ErrorKind::MalformedRelay,
            RelayError::UnknownServicer(_) => ErrorKind::UnknownServicer,
            RelayError::NodeUnhealthy { .. } => ErrorKind::NodeUnhealthy,
            RelayError::SessionPending { .. } => ErrorKind::SessionPending,
            RelayError::SessionInvalid(_) => ErrorKind::SessionInvalid,
            RelayError::SessionExhausted => ErrorKind::SessionExhausted,
            RelayError::OutOfSync { .. } => ErrorKind::OutOfSync,
            RelayError::ChainNotHosted(_) => ErrorKind::ChainNotHosted,
            RelayError::ChainCallFailure { .. } => ErrorKind::ChainCallFailure,
            RelayError::Signing(_) => ErrorKind::SigningFailure,
            RelayError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// `(codespace, code)` pair reported to the client. Servicer codes are
    /// forwarded untouched.
    pub fn code(&self) -> (&str, u32) {
        match self {
            RelayError::SessionInvalid(err) => (err.codespace.as_str(), err.code),
            RelayError::Malformed(_) => (MESH_CODESPACE, codes::MESH_MALFORMED_RELAY),
            RelayError::UnknownServicer(_) => (MESH_CODESPACE, codes::MESH_UNKNOWN_SERVICER),
            RelayError::NodeUnhealthy { .. } => (MESH_CODESPACE, codes::MESH_NODE_UNHEALTHY),
            RelayError::SessionPending { .. } => (MESH_CODESPACE, codes::MESH_SESSION_PENDING),
            RelayError::SessionExhausted => (MESH_CODESPACE, codes::MESH_SESSION_EXHAUSTED),
            RelayError::OutOfSync { .. } => (MESH_CODESPACE, codes::MESH_OUT_OF_SYNC),
            RelayError::ChainNotHosted(_) => (MESH_CODESPACE, codes::MESH_CHAIN_NOT_HOSTED),
            RelayError::ChainCallFailure { .. } => {
                (MESH_CODESPACE, codes::MESH_CHAIN_CALL_FAILURE)
            }
            RelayError::Signing(_) => (MESH_CODESPACE, codes::MESH_SIGNING_FAILURE),
            RelayError::Internal(_) => (MESH_CODESPACE, codes::MESH_INTERNAL),
        }
    }

    pub fn to_body(&self, dispatch: Option<Dispatch>) -> ClientErrorBody {
        let (codespace, code) = self.code();
        ClientErrorBody {
            signature: false,
            error: ErrorBody {
                kind: self.kind(),
                code,
                codespace: codespace.to_string(),
                message: self.to_string(),
            },
            dispatch,
        }
    }
}

/// `kind` names the failure (`"UnknownServicer"`, `"SessionInvalid"`, ...).
/// `code` is numeric within `codespace`: servicer errors keep the servicer's
/// own pair, dispatcher errors use the `mesh` codespace from [`codes`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub code: u32,
    pub codespace: String,
    pub message: String,
}

/// 400 body returned for any failed relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientErrorBody {
    pub signature: bool,
    pub error: ErrorBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dispatch: Option<Dispatch>,
}
