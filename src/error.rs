//! Service-level error types
//!
//! Protocol adapters report plain `anyhow::Error`s; these enums are what the
//! connection manager and credential broker hand back to callers.

use crate::client::ConnectionId;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Not connected: {0}")]
    NotConnected(ConnectionId),

    #[error("Authentication required for {0}")]
    NeedsAuthentication(ConnectionId),

    #[error("Handshake with {id} failed: {source:#}")]
    Handshake {
        id: ConnectionId,
        #[source]
        source: anyhow::Error,
    },

    #[error("No connection available for {0}")]
    Unavailable(ConnectionId),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("Password request for {0} was cancelled")]
    Cancelled(ConnectionId),
}
