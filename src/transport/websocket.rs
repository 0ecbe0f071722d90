//! WebSocket transport (RFC 6455 over TCP)
//!
//! Carries the same byte stream as the TCP backend, wrapped in WebSocket
//! frames so browser clients can participate. Each connection keeps two
//! buffers: the raw socket-side buffer, where the HTTP upgrade request and
//! incoming frames accumulate, and the application-side buffer holding
//! unwrapped payload bytes. Frame boundaries are not aligned with read
//! boundaries, so both are needed.
//!
//! Every `send` emits exactly one binary frame. Callers that need several
//! logical records in one frame must concatenate before sending.

use super::{
    outq_bytes, poll_writable, recv_nonblocking, send_all, AcceptCallback, Connection, RawRecv,
    RecvResult, SendResult, Transport, RELIABLE_SEND_WAIT_MS, UNRELIABLE_DROP_BYTES,
};
use super::tcp::{bind_listener, split_address};
use crate::error::{Error, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use log::{debug, error, info, warn};
use sha1::{Digest, Sha1};
use std::io::ErrorKind;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

/// GUID fixed by RFC 6455 for the accept-key digest
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// FIN + binary opcode, the only frame kind the relay emits
const FRAME_BINARY: u8 = 0x82;

/// Grace for finishing a partially written unreliable frame before giving up
const PARTIAL_FRAME_WAIT_MS: i32 = 1;

/// Writability wait for reliable frame sends
const RELIABLE_FRAME_WAIT_MS: i32 = 10;

/// `Sec-WebSocket-Accept` value for a client key
pub(crate) fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Wrap a payload in a single server-to-client binary frame (no mask)
pub(crate) fn encode_frame(data: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(data.len() + 10);
    frame.push(FRAME_BINARY);

    if data.len() < 126 {
        frame.push(data.len() as u8);
    } else if data.len() < 65536 {
        frame.push(126);
        frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
    } else {
        frame.push(127);
        frame.extend_from_slice(&(data.len() as u64).to_be_bytes());
    }

    frame.extend_from_slice(data);
    frame
}

/// Unwrap every complete frame in `sock_buffer` into `app_buffer`,
/// consuming the parsed bytes. Incomplete trailing frames stay put.
///
/// Client frames carry a 4-byte XOR mask; the payload is unmasked on the
/// way through. Control frames are passed along as data: the relay's own
/// protocol framing makes stray control payloads harmless, and peers that
/// close just drop the socket.
pub(crate) fn drain_frames(sock_buffer: &mut Vec<u8>, app_buffer: &mut Vec<u8>) {
    while sock_buffer.len() >= 2 {
        let masked = sock_buffer[1] & 0x80 != 0;
        let mut payload_len = (sock_buffer[1] & 0x7F) as usize;
        let mut header_len = 2usize;

        if payload_len == 126 {
            if sock_buffer.len() < 4 {
                return;
            }
            payload_len = u16::from_be_bytes([sock_buffer[2], sock_buffer[3]]) as usize;
            header_len = 4;
        } else if payload_len == 127 {
            if sock_buffer.len() < 10 {
                return;
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&sock_buffer[2..10]);
            payload_len = u64::from_be_bytes(bytes) as usize;
            header_len = 10;
        }

        let mut mask = [0u8; 4];
        if masked {
            if sock_buffer.len() < header_len + 4 {
                return;
            }
            mask.copy_from_slice(&sock_buffer[header_len..header_len + 4]);
            header_len += 4;
        }

        if sock_buffer.len() < header_len + payload_len {
            return;
        }

        let payload = &sock_buffer[header_len..header_len + payload_len];
        if masked {
            app_buffer.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        } else {
            app_buffer.extend_from_slice(payload);
        }

        sock_buffer.drain(..header_len + payload_len);
    }
}

pub(crate) enum UpgradeParse {
    /// Request boundary not seen yet
    Pending,
    /// Request complete but no Sec-WebSocket-Key header
    MissingKey,
    Complete {
        accept_key: String,
        /// Bytes of HTTP request to consume, including the CRLF-CRLF
        consumed: usize,
    },
}

/// Scan the raw buffer for a complete HTTP upgrade request and compute the
/// accept key from its `Sec-WebSocket-Key` header
pub(crate) fn parse_upgrade_request(sock_buffer: &[u8]) -> UpgradeParse {
    let Some(boundary) = sock_buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
    else {
        return UpgradeParse::Pending;
    };

    let request = String::from_utf8_lossy(&sock_buffer[..boundary]);

    let Some(key) = request.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            Some(value.trim().to_string())
        } else {
            None
        }
    }) else {
        return UpgradeParse::MissingKey;
    };

    UpgradeParse::Complete {
        accept_key: compute_accept_key(&key),
        consumed: boundary + 4,
    }
}

enum UpgradeState {
    Complete,
    Pending,
    Failed,
}

/// A WebSocket connection in either pre- or post-upgrade state
pub struct WebSocketConnection {
    stream: TcpStream,
    open: bool,
    handshake_complete: bool,
    /// Raw bytes as read from the socket
    sock_buffer: Vec<u8>,
    /// Unwrapped frame payloads awaiting the caller
    app_buffer: Vec<u8>,
}

impl WebSocketConnection {
    fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("Failed to set nonblocking mode on WebSocket socket: {}", e);
        }
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Self {
            stream,
            open: true,
            handshake_complete: false,
            sock_buffer: Vec::new(),
            app_buffer: Vec::new(),
        }
    }

    fn drain_app_buffer(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.app_buffer.len());
        buf[..n].copy_from_slice(&self.app_buffer[..n]);
        self.app_buffer.drain(..n);
        n
    }

    fn try_upgrade(&mut self) -> UpgradeState {
        match parse_upgrade_request(&self.sock_buffer) {
            UpgradeParse::Pending => UpgradeState::Pending,
            UpgradeParse::MissingKey => {
                warn!("WebSocket upgrade request without Sec-WebSocket-Key, closing");
                self.close();
                UpgradeState::Failed
            }
            UpgradeParse::Complete {
                accept_key,
                consumed,
            } => {
                let response = format!(
                    "HTTP/1.1 101 Switching Protocols\r\n\
                     Upgrade: websocket\r\n\
                     Connection: Upgrade\r\n\
                     Sec-WebSocket-Accept: {}\r\n\r\n",
                    accept_key
                );

                if !send_all(
                    self.stream.as_raw_fd(),
                    response.as_bytes(),
                    RELIABLE_SEND_WAIT_MS,
                ) {
                    self.close();
                    return UpgradeState::Failed;
                }

                self.sock_buffer.drain(..consumed);
                self.handshake_complete = true;
                debug!("WebSocket upgrade complete");
                UpgradeState::Complete
            }
        }
    }
}

impl Connection for WebSocketConnection {
    fn send(&mut self, data: &[u8], reliable: bool) -> SendResult {
        if !self.open || !self.handshake_complete {
            self.close();
            return SendResult::Closed;
        }

        let fd = self.stream.as_raw_fd();

        // The fullness check happens before the frame is built, so a drop
        // costs nothing and never leaves half a frame on the wire.
        if !reliable {
            match outq_bytes(fd) {
                Some(unsent) => {
                    if unsent > UNRELIABLE_DROP_BYTES {
                        return SendResult::Dropped;
                    }
                }
                None => {
                    if !poll_writable(fd, 0) {
                        return SendResult::Dropped;
                    }
                }
            }
        }

        let frame = encode_frame(data);
        let mut total_sent = 0usize;

        while total_sent < frame.len() {
            let rc = unsafe {
                libc::send(
                    fd,
                    frame[total_sent..].as_ptr() as *const libc::c_void,
                    frame.len() - total_sent,
                    libc::MSG_NOSIGNAL,
                )
            };

            if rc < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                        if !reliable && total_sent == 0 {
                            // Nothing written yet: drop whole frame
                            return SendResult::Dropped;
                        }
                        // A partial frame is on the wire; it must be finished
                        // or the stream is corrupt. Unreliable sends get one
                        // short grace, reliable sends a bounded wait.
                        let wait = if reliable {
                            RELIABLE_FRAME_WAIT_MS
                        } else {
                            PARTIAL_FRAME_WAIT_MS
                        };
                        if !poll_writable(fd, wait) {
                            self.close();
                            return SendResult::Closed;
                        }
                    }
                    Some(libc::EINTR) => {}
                    _ => {
                        self.close();
                        return SendResult::Closed;
                    }
                }
                continue;
            }

            total_sent += rc as usize;
        }

        // Logical payload bytes, not frame bytes
        SendResult::Sent(data.len())
    }

    fn receive(&mut self, buf: &mut [u8]) -> RecvResult {
        if !self.open {
            return RecvResult::Closed;
        }

        // Serve already-unwrapped data before touching the socket
        if !self.app_buffer.is_empty() {
            return RecvResult::Data(self.drain_app_buffer(buf));
        }

        let mut temp = [0u8; 4096];
        match recv_nonblocking(self.stream.as_raw_fd(), &mut temp) {
            RawRecv::Data(n) => self.sock_buffer.extend_from_slice(&temp[..n]),
            RawRecv::WouldBlock => return RecvResult::WouldBlock,
            RawRecv::Eof | RawRecv::Error => {
                self.close();
                return RecvResult::Closed;
            }
        }

        if !self.handshake_complete {
            match self.try_upgrade() {
                UpgradeState::Complete => {
                    // Frames may have arrived piggybacked on the upgrade
                    let mut app = std::mem::take(&mut self.app_buffer);
                    drain_frames(&mut self.sock_buffer, &mut app);
                    self.app_buffer = app;
                }
                UpgradeState::Pending => return RecvResult::WouldBlock,
                UpgradeState::Failed => return RecvResult::Closed,
            }
        } else {
            let mut app = std::mem::take(&mut self.app_buffer);
            drain_frames(&mut self.sock_buffer, &mut app);
            self.app_buffer = app;
        }

        if self.app_buffer.is_empty() {
            RecvResult::WouldBlock
        } else {
            RecvResult::Data(self.drain_app_buffer(buf))
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

/// WebSocket listener. Outbound connections are not supported: browser
/// peers dial in, the relay never dials out.
#[derive(Default)]
pub struct WebSocketTransport {
    listener: Option<TcpListener>,
    accept_callback: Option<AcceptCallback>,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for WebSocketTransport {
    fn listen(&mut self, address: &str) -> Result<()> {
        if self.listener.is_some() {
            return Err(Error::Transport("already listening".to_string()));
        }

        let (ip, port) = split_address(address)?;
        self.listener = Some(bind_listener(ip, port)?);

        info!("WebSocket transport listening on {}:{}", ip, port);
        Ok(())
    }

    fn accept(&mut self) -> Option<Box<dyn Connection>> {
        let listener = self.listener.as_ref()?;

        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("Accepted WebSocket connection from {}", addr);
                let connection = WebSocketConnection::new(stream);
                if let Some(callback) = self.accept_callback.as_mut() {
                    callback(&connection);
                }
                Some(Box::new(connection))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                error!("Failed to accept WebSocket connection: {}", e);
                None
            }
        }
    }

    fn connect(&mut self, _address: &str) -> Option<Box<dyn Connection>> {
        warn!("WebSocket transport does not support outbound connections");
        None
    }

    fn close(&mut self) {
        self.listener = None;
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

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a masked client-to-server frame the way a browser would
    fn client_frame(payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![FRAME_BINARY];
        if payload.len() < 126 {
            frame.push(0x80 | payload.len() as u8);
        } else if payload.len() < 65536 {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        frame
    }

    #[test]
    fn test_accept_key_rfc_example() {
        // Worked example from RFC 6455 section 1.3
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_encode_frame_length_variants() {
        let small = encode_frame(&[0xAB; 5]);
        assert_eq!(&small[..2], &[0x82, 5]);
        assert_eq!(small.len(), 2 + 5);

        let medium = encode_frame(&[0u8; 300]);
        assert_eq!(&medium[..4], &[0x82, 126, 0x01, 0x2C]);
        assert_eq!(medium.len(), 4 + 300);

        let large = encode_frame(&[0u8; 70000]);
        assert_eq!(large[0], 0x82);
        assert_eq!(large[1], 127);
        assert_eq!(
            u64::from_be_bytes(large[2..10].try_into().unwrap()),
            70000
        );
        assert_eq!(large.len(), 10 + 70000);
    }

    #[test]
    fn test_drain_frames_unmasks_client_payload() {
        let payload = b"PERUN_HELLO\x00\x01\x00\x03";
        let mut sock = client_frame(payload, [0x12, 0x34, 0x56, 0x78]);
        let mut app = Vec::new();

        drain_frames(&mut sock, &mut app);
        assert_eq!(app, payload);
        assert!(sock.is_empty());
    }

    #[test]
    fn test_drain_frames_waits_for_complete_frame() {
        let payload = [0x42u8; 32];
        let frame = client_frame(&payload, [1, 2, 3, 4]);

        let mut sock = frame[..10].to_vec();
        let mut app = Vec::new();
        drain_frames(&mut sock, &mut app);
        assert!(app.is_empty());
        assert_eq!(sock.len(), 10);

        sock.extend_from_slice(&frame[10..]);
        drain_frames(&mut sock, &mut app);
        assert_eq!(app, payload);
        assert!(sock.is_empty());
    }

    #[test]
    fn test_drain_frames_consumes_back_to_back_frames() {
        let mut sock = client_frame(b"first", [9, 9, 9, 9]);
        sock.extend_from_slice(&client_frame(b"second", [7, 7, 7, 7]));
        let mut app = Vec::new();

        drain_frames(&mut sock, &mut app);
        assert_eq!(app, b"firstsecond");
    }

    #[test]
    fn test_drain_frames_extended_length() {
        let payload = vec![0x5Au8; 300];
        let mut sock = client_frame(&payload, [0xAA, 0xBB, 0xCC, 0xDD]);
        let mut app = Vec::new();

        drain_frames(&mut sock, &mut app);
        assert_eq!(app, payload);
    }

    #[test]
    fn test_parse_upgrade_request() {
        let request = b"GET /stream HTTP/1.1\r\n\
                        Host: relay\r\n\
                        Upgrade: websocket\r\n\
                        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\ntrailing";

        match parse_upgrade_request(request) {
            UpgradeParse::Complete {
                accept_key,
                consumed,
            } => {
                assert_eq!(accept_key, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
                assert_eq!(&request[consumed..], b"trailing");
            }
            _ => panic!("expected complete upgrade"),
        }
    }

    #[test]
    fn test_parse_upgrade_request_pending_and_missing_key() {
        assert!(matches!(
            parse_upgrade_request(b"GET / HTTP/1.1\r\nHost: relay\r\n"),
            UpgradeParse::Pending
        ));
        assert!(matches!(
            parse_upgrade_request(b"GET / HTTP/1.1\r\nHost: relay\r\n\r\n"),
            UpgradeParse::MissingKey
        ));
    }
}
