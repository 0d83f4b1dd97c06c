use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors returned by tunnel lifecycle operations
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("port {0} is already forwarded")]
    DuplicatePort(u16),

    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("no tunnel on port {0}")]
    NotFound(u16),

    #[error("tunnel manager is shut down")]
    Closed,
}

/// Errors opening a stream to a remote destination.
///
/// These are scoped to a single inbound connection and never change the
/// status of the tunnel that triggered the dial.
#[derive(Error, Debug)]
pub enum DialError {
    #[error("invalid destination {0:?}, expected host:port")]
    InvalidDestination(String),

    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: io::Error,
    },

    #[error("gateway refused channel to {destination}: {reason}")]
    Channel { destination: String, reason: String },

    #[error("transport is closed")]
    Closed,
}

/// Errors establishing the SSH gateway session
#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Host key rejected: {0}")]
    HostKeyRejected(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
