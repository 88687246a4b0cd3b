use std::io;

use thiserror::Error;

use crate::bridge::protocol::ConnId;

/// Session-ending failure. Recoverable conditions never surface here; they are logged.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to listen TCP on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read listener address: {0}")]
    LocalAddr(#[source] io::Error),

    #[error("failed to accept connection by non temporary error: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to read incoming data: {0}")]
    Input(#[source] io::Error),

    #[error("failed to write to upstream: {0}")]
    Output(#[source] io::Error),

    #[error("failed to read from connection {id}: {source}")]
    Connection {
        id: ConnId,
        #[source]
        source: io::Error,
    },
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// End-of-stream conditions that read loops treat as a clean close.
pub(crate) fn is_end_of_stream(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}
