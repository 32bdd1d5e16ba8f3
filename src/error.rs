//! Errors reported by the control surfaces.
//!
//! Failures inside running tasks (reads, writes, accepts) never surface here; they are written to
//! the log where they happen and the affected connection winds down on its own.

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Address is not valid")]
    InvalidAddress(String),

    #[error("Port is not valid")]
    InvalidPort(String),

    #[error("Port is out of range")]
    PortOutOfRange(i64),

    #[error("Server is already running")]
    AlreadyActive,

    #[error("Client is already connected")]
    AlreadyConnected,

    #[error("{0}")]
    Bind(#[source] io::Error),

    #[error("could not start the I/O runtime: {0}")]
    Runtime(#[source] io::Error),

    #[error("outbound queue is closed")]
    QueueClosed,
}
