//! Error types for the agent engine.
//!
//! Only [`SessionError`] ever ends a channel.  Everything below it is
//! absorbed into the single `SSH_AGENT_FAILURE` byte by the request
//! handlers, so the peer never learns which of these occurred.

use keyrelay_core::ProviderError;

use crate::proto::Opcode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated input: need {needed} bytes, {remaining} remaining")]
    TruncatedInput { needed: usize, remaining: usize },

    #[error("declared length {declared} exceeds limit {limit}")]
    MalformedLength { declared: usize, limit: usize },

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("unsupported key algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("algorithm name is not valid UTF-8")]
    InvalidUtf8,

    #[error("unexpected opcode {0}")]
    UnexpectedOpcode(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("empty message")]
    Empty,

    #[error("unknown opcode {0}")]
    UnknownOpcode(u8),

    #[error("unsupported request: {0:?}")]
    Unsupported(Opcode),

    #[error("malformed request: {0}")]
    Wire(#[from] WireError),

    #[error("no identity matches the requested key")]
    IdentityNotFound,

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("peer {0} is not in the allow-list")]
    UnauthorizedPeer(String),

    #[error("unexpected message type {0:?}")]
    MalformedEnvelope(String),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
