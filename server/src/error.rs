//! Error taxonomy for the server.
//!
//! Only [`ServerError::Bind`] is fatal, and only at startup. Everything else
//! is recoverable: a malformed message or an unknown sender drops that one
//! message, a failed send degrades delivery to that one recipient. The loop
//! favors availability over strict consistency.

use crate::transport::{BindError, ConnId, SendError};
use shared::DecodeError;
use std::fmt;

#[derive(Debug)]
pub enum ServerError {
    /// Port unavailable; the server never enters its listening state.
    Bind(BindError),
    /// A send to one recipient failed; isolated to that recipient.
    Send(SendError),
    /// Malformed inbound payload; the message is dropped.
    Decode(DecodeError),
    /// Message from a connection with no live client session; dropped.
    UnknownClient(ConnId),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind(e) => write!(f, "bind error: {}", e),
            ServerError::Send(e) => write!(f, "send error: {}", e),
            ServerError::Decode(e) => write!(f, "decode error: {}", e),
            ServerError::UnknownClient(conn) => {
                write!(f, "no live session for connection {}", conn)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(e) => Some(e),
            ServerError::Send(e) => Some(e),
            ServerError::Decode(e) => Some(e),
            ServerError::UnknownClient(_) => None,
        }
    }
}

impl From<BindError> for ServerError {
    fn from(err: BindError) -> Self {
        ServerError::Bind(err)
    }
}

impl From<SendError> for ServerError {
    fn from(err: SendError) -> Self {
        ServerError::Send(err)
    }
}

impl From<DecodeError> for ServerError {
    fn from(err: DecodeError) -> Self {
        ServerError::Decode(err)
    }
}
