//! PerunRelay - Streaming relay for emulator video, audio and input
//!
//! This library provides the core components for relaying emulator-style
//! media streams between producers and consumers over heterogeneous
//! transports (UNIX sockets, TCP, browser WebSocket).
//!
//! ## Components
//!
//! - [`protocol`]: binary wire codec and handshake frames
//! - [`transport`]: non-blocking stream transports with per-send reliability
//! - [`server`]: multi-transport server with buffered framing and broadcast
//! - [`client`]: headless protocol client with delta frame reassembly

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use error::{Error, Result};
pub use server::{Server, ServerCallbacks};
