//! UNIX domain socket transport
//!
//! Addresses are filesystem paths. The listener unlinks any stale socket
//! file before binding and removes its own file exactly once on close.
//! Unreliable sends use a zero-timeout writability poll as the fullness
//! signal: a socket that is not immediately writable drops the buffer.

use super::{
    poll_writable, recv_nonblocking, send_all, AcceptCallback, Connection, RawRecv, RecvResult,
    SendResult, Transport, RELIABLE_SEND_WAIT_MS,
};
use crate::error::{Error, Result};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;

/// A single accepted or dialed UNIX stream connection
pub struct UnixConnection {
    stream: UnixStream,
    open: bool,
}

impl UnixConnection {
    fn new(stream: UnixStream) -> Self {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("Failed to set nonblocking mode on unix socket: {}", e);
        }
        Self { stream, open: true }
    }
}

impl Connection for UnixConnection {
    fn send(&mut self, data: &[u8], reliable: bool) -> SendResult {
        if !self.open {
            return SendResult::Closed;
        }

        let fd = self.stream.as_raw_fd();

        // Fullness signal for unreliable sends: not immediately writable
        // means the socket buffer is already deep, so drop.
        if !reliable && !poll_writable(fd, 0) {
            return SendResult::Dropped;
        }

        if send_all(fd, data, RELIABLE_SEND_WAIT_MS) {
            SendResult::Sent(data.len())
        } else {
            self.close();
            SendResult::Closed
        }
    }

    fn receive(&mut self, buf: &mut [u8]) -> RecvResult {
        if !self.open {
            return RecvResult::Closed;
        }

        match recv_nonblocking(self.stream.as_raw_fd(), buf) {
            RawRecv::Data(n) => RecvResult::Data(n),
            RawRecv::WouldBlock => RecvResult::WouldBlock,
            RawRecv::Eof | RawRecv::Error => {
                self.close();
                RecvResult::Closed
            }
        }
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn descriptor(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// UNIX domain socket listener/dialer
#[derive(Default)]
pub struct UnixTransport {
    listener: Option<UnixListener>,
    socket_path: Option<PathBuf>,
    accept_callback: Option<AcceptCallback>,
}

impl UnixTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for UnixTransport {
    fn listen(&mut self, address: &str) -> Result<()> {
        if self.listener.is_some() {
            return Err(Error::Transport("already listening".to_string()));
        }

        // Remove a stale socket file from a previous run
        let _ = std::fs::remove_file(address);

        let listener = UnixListener::bind(address).map_err(|e| {
            Error::Transport(format!("Failed to bind unix socket {}: {}", address, e))
        })?;
        listener.set_nonblocking(true)?;

        self.socket_path = Some(PathBuf::from(address));
        self.listener = Some(listener);

        info!("Unix transport listening on {}", address);
        Ok(())
    }

    fn accept(&mut self) -> Option<Box<dyn Connection>> {
        let listener = self.listener.as_ref()?;

        match listener.accept() {
            Ok((stream, _)) => {
                let connection = UnixConnection::new(stream);
                if let Some(callback) = self.accept_callback.as_mut() {
                    callback(&connection);
                }
                Some(Box::new(connection))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                error!("Failed to accept unix connection: {}", e);
                None
            }
        }
    }

    fn connect(&mut self, address: &str) -> Option<Box<dyn Connection>> {
        match UnixStream::connect(address) {
            Ok(stream) => {
                debug!("Connected to unix socket {}", address);
                Some(Box::new(UnixConnection::new(stream)))
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", address, e);
                None
            }
        }
    }

    fn close(&mut self) {
        if let Some(listener) = self.listener.take() {
            drop(listener);
        }
        // Unlink the socket file exactly once
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(&path);
        }
    }

    fn is_listening(&self) -> bool {
        self.listener.is_some()
    }

    fn listen_descriptor(&self) -> RawFd {
        self.listener.as_ref().map_or(-1, |l| l.as_raw_fd())
    }

    fn set_accept_callback(&mut self, callback: AcceptCallback) {
        self.accept_callback = Some(callback);
    }
}

impl Drop for UnixTransport {
    fn drop(&mut self) {
        self.close();
    }
}
