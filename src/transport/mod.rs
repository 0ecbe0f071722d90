//! Transport layer for stream I/O abstraction
//!
//! Three backends speak the same byte stream: UNIX domain sockets, plain TCP
//! and WebSocket (TCP plus RFC 6455 framing). All sockets are non-blocking;
//! the only waits in the layer are the bounded writability polls inside
//! reliable sends.

use crate::error::Result;
use std::os::unix::io::RawFd;

mod tcp;
mod unix;
mod websocket;

pub use tcp::TcpTransport;
pub use unix::UnixTransport;
pub use websocket::WebSocketTransport;

/// Bounded wait for writability inside a reliable send, per stall
pub(crate) const RELIABLE_SEND_WAIT_MS: i32 = 100;

/// Unsent-queue depth above which unreliable sends drop. Roughly eight
/// 640x480 delta frames, capping added latency near 130 ms at 60 FPS.
pub(crate) const UNRELIABLE_DROP_BYTES: usize = 64 * 1024;

/// Outcome of a [`Connection::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// Every byte was handed to the kernel
    Sent(usize),
    /// Unreliable send refused to queue; nothing was written
    Dropped,
    /// Fatal error; the connection has been closed as a side effect
    Closed,
}

impl SendResult {
    /// True when all `len` bytes went out
    pub fn is_complete(&self, len: usize) -> bool {
        matches!(self, SendResult::Sent(n) if *n == len)
    }
}

/// Outcome of a [`Connection::receive`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvResult {
    /// `n` bytes were written into the caller's buffer
    Data(usize),
    /// No data available; the connection is still open
    WouldBlock,
    /// Peer closed or fatal error; the connection is now closed
    Closed,
}

/// Callback fired for every accepted connection, before `accept` returns it
pub type AcceptCallback = Box<dyn FnMut(&dyn Connection) + Send>;

/// A single bidirectional stream connection
pub trait Connection: Send {
    /// Send data over the connection.
    ///
    /// `reliable` sends either deliver every byte or close the connection;
    /// they may wait for writability up to a short bound. Unreliable sends
    /// never wait: if the outbound queue is already deep they drop the whole
    /// buffer and report [`SendResult::Dropped`] without writing a partial
    /// wire frame.
    fn send(&mut self, data: &[u8], reliable: bool) -> SendResult;

    /// Receive available data without blocking
    fn receive(&mut self, buf: &mut [u8]) -> RecvResult;

    /// Close the connection. Idempotent; a closed connection may not be
    /// reused.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// File descriptor for readiness polling
    fn descriptor(&self) -> RawFd;
}

/// A listener/dialer for one transport backend
pub trait Transport: Send {
    /// Start listening on a transport-specific address
    /// (e.g. "/tmp/perun.sock", "0.0.0.0:8080", ":8080")
    fn listen(&mut self, address: &str) -> Result<()>;

    /// Accept a pending connection; `None` when none is pending
    fn accept(&mut self) -> Option<Box<dyn Connection>>;

    /// Dial a remote endpoint; `None` on failure (diagnostic logged)
    fn connect(&mut self, address: &str) -> Option<Box<dyn Connection>>;

    /// Stop listening and release the listener
    fn close(&mut self);

    fn is_listening(&self) -> bool;

    /// Listening descriptor for readiness polling, -1 when not listening
    fn listen_descriptor(&self) -> RawFd;

    /// Register an observer invoked for every accepted connection
    fn set_accept_callback(&mut self, callback: AcceptCallback);
}

// ============================================================================
// Shared raw-fd helpers
// ============================================================================

/// Wait up to `timeout_ms` for the socket to become writable
pub(crate) fn poll_writable(fd: RawFd, timeout_ms: i32) -> bool {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) > 0 }
}

/// Raw non-blocking receive outcome, before connection state is applied
pub(crate) enum RawRecv {
    Data(usize),
    WouldBlock,
    Eof,
    Error,
}

/// One non-blocking `recv(2)` on a raw descriptor
pub(crate) fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> RawRecv {
    let rc = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if rc > 0 {
        return RawRecv::Data(rc as usize);
    }
    if rc == 0 {
        return RawRecv::Eof;
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => RawRecv::WouldBlock,
        Some(libc::EINTR) => RawRecv::WouldBlock,
        _ => RawRecv::Error,
    }
}

/// Send the whole buffer on a non-blocking socket, waiting for writability
/// up to `wait_ms` per stall. MSG_NOSIGNAL keeps a dead peer from raising
/// SIGPIPE. Returns false on timeout or fatal error; the caller closes the
/// connection.
pub(crate) fn send_all(fd: RawFd, data: &[u8], wait_ms: i32) -> bool {
    let mut total_sent = 0usize;

    while total_sent < data.len() {
        let rc = unsafe {
            libc::send(
                fd,
                data[total_sent..].as_ptr() as *const libc::c_void,
                data.len() - total_sent,
                libc::MSG_NOSIGNAL,
            )
        };

        if rc < 0 {
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                    // Socket buffer full: wait for writability, bounded
                    if !poll_writable(fd, wait_ms) {
                        return false;
                    }
                }
                Some(libc::EINTR) => {}
                _ => return false,
            }
            continue;
        }

        total_sent += rc as usize;
    }

    true
}

/// Bytes sitting unsent in the kernel send queue, `None` when the query is
/// unsupported
pub(crate) fn outq_bytes(fd: RawFd) -> Option<usize> {
    let mut unsent: libc::c_int = 0;
    // SIOCOUTQ is an alias of TIOCOUTQ on Linux sockets
    let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ as _, &mut unsent) };
    if rc == 0 {
        Some(unsent as usize)
    } else {
        None
    }
}

/// Raise SO_SNDBUF on a raw descriptor
pub(crate) fn set_send_buffer(fd: RawFd, bytes: usize) {
    let size = bytes as libc::c_int;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &size as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        log::warn!(
            "Failed to set send buffer to {} bytes: {}",
            bytes,
            std::io::Error::last_os_error()
        );
    }
}
