//! Error types for the relay
//!
//! # Error Recovery Strategies
//!
//! ## Setup Errors (Fix and Restart)
//!
//! - **`Config`**: An address could not be parsed. Fix the flag value and
//!   restart.
//! - **`Transport`**: A listener failed to bind or a dial failed. Check that
//!   the port is free and the socket path is writable.
//!
//! ## Protocol Errors (Log and Continue)
//!
//! - **`Protocol`**: A handshake was rejected or a frame was malformed. The
//!   offending connection is closed; the server keeps running.
//!
//! ## Transient I/O
//!
//! Would-block, short reads and short writes never surface as errors. They
//! are absorbed inside the transport layer and reported through the
//! [`SendResult`](crate::transport::SendResult) /
//! [`RecvResult`](crate::transport::RecvResult) status enums instead.

use thiserror::Error;

/// Errors that can occur in the relay
///
/// See module-level documentation for recovery strategies.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
