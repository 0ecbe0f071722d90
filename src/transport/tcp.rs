//! TCP stream transport
//!
//! Addresses are `"host:port"` with an IPv4 literal host, or `":port"` to
//! bind all interfaces. Listeners take SO_REUSEADDR so a restarted relay can
//! rebind immediately; every connection disables Nagle (TCP_NODELAY) and
//! raises SO_SNDBUF so bursts of video frames fit in the kernel queue.
//! Unreliable sends consult the SIOCOUTQ unsent counter and drop when the
//! queue is already deep, falling back to a zero-timeout writability poll
//! where the counter is unsupported.

use super::{
    outq_bytes, poll_writable, recv_nonblocking, send_all, set_send_buffer, AcceptCallback,
    Connection, RawRecv, RecvResult, SendResult, Transport, RELIABLE_SEND_WAIT_MS,
    UNRELIABLE_DROP_BYTES,
};
use crate::error::{Error, Result};
use log::{debug, error, info, warn};
use std::io::ErrorKind;
use std::net::{Ipv4Addr, Shutdown, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// SO_SNDBUF for every connection, sized for bursts of video frames
const SEND_BUFFER_BYTES: usize = 128 * 1024;

/// Split `"host:port"` / `":port"` into an IPv4 address and port
pub(crate) fn split_address(address: &str) -> Result<(Ipv4Addr, u16)> {
    let colon = address
        .rfind(':')
        .ok_or_else(|| Error::Config(format!("Invalid address format: {}", address)))?;

    let host = &address[..colon];
    let port = address[colon + 1..]
        .parse::<u16>()
        .map_err(|_| Error::Config(format!("Invalid port in address: {}", address)))?;

    let ip = if host.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        host.parse::<Ipv4Addr>()
            .map_err(|_| Error::Config(format!("Invalid IP address: {}", host)))?
    };

    Ok((ip, port))
}

/// Bind a non-blocking listener with SO_REUSEADDR set before bind, which std
/// does not expose
pub(crate) fn bind_listener(ip: Ipv4Addr, port: u16) -> Result<TcpListener> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(Error::Transport(format!(
                "Failed to create TCP socket: {}",
                std::io::Error::last_os_error()
            )));
        }

        let reuse: libc::c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &reuse as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr = libc::in_addr {
            s_addr: u32::from(ip).to_be(),
        };

        if libc::bind(
            fd,
            &addr as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Transport(format!(
                "Failed to bind {}:{}: {}",
                ip, port, err
            )));
        }

        if libc::listen(fd, 5) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(Error::Transport(format!(
                "Failed to listen on {}:{}: {}",
                ip, port, err
            )));
        }

        let listener = TcpListener::from_raw_fd(fd);
        listener.set_nonblocking(true)?;
        Ok(listener)
    }
}

/// A single accepted or dialed TCP connection
pub struct TcpConnection {
    stream: TcpStream,
    open: bool,
}

impl TcpConnection {
    pub(crate) fn new(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!("Failed to set nonblocking mode on TCP socket: {}", e);
        }
        // Nagle off for latency
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        set_send_buffer(stream.as_raw_fd(), SEND_BUFFER_BYTES);
        Self { stream, open: true }
    }
}

impl Connection for TcpConnection {
    fn send(&mut self, data: &[u8], reliable: bool) -> SendResult {
        if !self.open {
            return SendResult::Closed;
        }

        let fd = self.stream.as_raw_fd();

        if !reliable {
            // Drop when the unsent queue is already deep. Where the counter
            // is unsupported, fall back to the zero-timeout writability poll.
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

/// TCP listener/dialer
#[derive(Default)]
pub struct TcpTransport {
    listener: Option<TcpListener>,
    accept_callback: Option<AcceptCallback>,
}

impl TcpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for TcpTransport {
    fn listen(&mut self, address: &str) -> Result<()> {
        if self.listener.is_some() {
            return Err(Error::Transport("already listening".to_string()));
        }

        let (ip, port) = split_address(address)?;
        self.listener = Some(bind_listener(ip, port)?);

        info!("TCP transport listening on {}:{}", ip, port);
        Ok(())
    }

    fn accept(&mut self) -> Option<Box<dyn Connection>> {
        let listener = self.listener.as_ref()?;

        match listener.accept() {
            Ok((stream, addr)) => {
                debug!("Accepted TCP connection from {}", addr);
                let connection = TcpConnection::new(stream);
                if let Some(callback) = self.accept_callback.as_mut() {
                    callback(&connection);
                }
                Some(Box::new(connection))
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                error!("Failed to accept TCP connection: {}", e);
                None
            }
        }
    }

    fn connect(&mut self, address: &str) -> Option<Box<dyn Connection>> {
        let (ip, port) = match split_address(address) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("{}", e);
                return None;
            }
        };

        match TcpStream::connect((ip, port)) {
            Ok(stream) => {
                debug!("Connected to {}:{}", ip, port);
                Some(Box::new(TcpConnection::new(stream)))
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", address, e);
                None
            }
        }
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

    fn listen_local(transport: &mut TcpTransport) -> String {
        transport.listen("127.0.0.1:0").unwrap();
        let addr = transport.listener.as_ref().unwrap().local_addr().unwrap();
        format!("127.0.0.1:{}", addr.port())
    }

    #[test]
    fn test_split_address() {
        assert_eq!(
            split_address("127.0.0.1:8080").unwrap(),
            (Ipv4Addr::new(127, 0, 0, 1), 8080)
        );
        assert_eq!(
            split_address(":9000").unwrap(),
            (Ipv4Addr::UNSPECIFIED, 9000)
        );
        assert!(split_address("8080").is_err());
        assert!(split_address("host.example:8080").is_err());
        assert!(split_address("127.0.0.1:notaport").is_err());
    }

    #[test]
    fn test_listen_accept_roundtrip() {
        let mut transport = TcpTransport::new();
        let address = listen_local(&mut transport);
        assert!(transport.is_listening());
        assert!(transport.accept().is_none());

        let mut client = transport.connect(&address).expect("connect");
        let mut server_side = loop {
            if let Some(conn) = transport.accept() {
                break conn;
            }
        };

        assert_eq!(client.send(b"hello", true), SendResult::Sent(5));

        let mut buf = [0u8; 16];
        let n = loop {
            match server_side.receive(&mut buf) {
                RecvResult::Data(n) => break n,
                RecvResult::WouldBlock => continue,
                RecvResult::Closed => panic!("connection closed"),
            }
        };
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn test_unreliable_send_drops_under_backpressure() {
        let mut transport = TcpTransport::new();
        let address = listen_local(&mut transport);

        let client = transport.connect(&address).expect("connect");
        let mut server_side = loop {
            if let Some(conn) = transport.accept() {
                break conn;
            }
        };

        // Nobody reads at the client: the send queue fills, then unreliable
        // sends start dropping instead of blocking or corrupting the stream.
        let chunk = vec![0u8; 64 * 1024];
        let mut dropped = false;
        for _ in 0..256 {
            match server_side.send(&chunk, false) {
                SendResult::Sent(_) => continue,
                SendResult::Dropped => {
                    dropped = true;
                    break;
                }
                SendResult::Closed => panic!("unreliable send closed the connection"),
            }
        }
        assert!(dropped);
        assert!(server_side.is_open());
        drop(client);
    }

    #[test]
    fn test_connect_refused_returns_none() {
        let mut transport = TcpTransport::new();
        // Reserve a port, then close the listener so the dial is refused
        let address = listen_local(&mut transport);
        transport.close();
        assert!(transport.connect(&address).is_none());
    }
}
