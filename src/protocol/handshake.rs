//! Connection handshake and capability negotiation
//!
//! A client opens every session with a 15-byte HELLO carrying its protocol
//! version and capability bitmap. The server answers with a 6-byte OK whose
//! capability field is the bitwise intersection of both sides, or with an
//! ERROR frame and a close. No packet framing happens before the handshake
//! settles.

/// Protocol version spoken by this crate
pub const PROTOCOL_VERSION: u16 = 1;

/// Magic prefix of the HELLO frame
pub const HELLO_MAGIC: &[u8; 11] = b"PERUN_HELLO";

/// Total size of a HELLO frame: magic(11) version(2) caps(2)
pub const HELLO_SIZE: usize = 15;

/// Supports XOR delta frames
pub const CAP_DELTA: u16 = 0x01;
/// Supports audio streaming
pub const CAP_AUDIO: u16 = 0x02;
/// Supports debug info packets
pub const CAP_DEBUG: u16 = 0x04;

/// Outcome of processing a HELLO or a server response
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeResult {
    pub accepted: bool,
    pub version: u16,
    /// Negotiated capabilities (client AND server)
    pub capabilities: u16,
    pub error: String,
}

impl HandshakeResult {
    fn rejected(error: &str) -> Self {
        Self {
            error: error.to_string(),
            ..Self::default()
        }
    }
}

/// Build the 15-byte client HELLO
pub fn create_hello(version: u16, caps: u16) -> Vec<u8> {
    let mut hello = Vec::with_capacity(HELLO_SIZE);
    hello.extend_from_slice(HELLO_MAGIC);
    hello.extend_from_slice(&version.to_be_bytes());
    hello.extend_from_slice(&caps.to_be_bytes());
    hello
}

/// Validate a client HELLO and negotiate capabilities
///
/// On version mismatch the result carries the client's version so the caller
/// can log what the peer asked for.
pub fn process_hello(data: &[u8], server_caps: u16) -> HandshakeResult {
    if data.len() < HELLO_SIZE {
        return HandshakeResult::rejected("Handshake too short");
    }

    if &data[..11] != HELLO_MAGIC {
        return HandshakeResult::rejected("Invalid magic string");
    }

    let client_version = u16::from_be_bytes([data[11], data[12]]);
    if client_version != PROTOCOL_VERSION {
        let mut result = HandshakeResult::rejected("Unsupported protocol version");
        result.version = client_version;
        return result;
    }

    let client_caps = u16::from_be_bytes([data[13], data[14]]);

    HandshakeResult {
        accepted: true,
        version: PROTOCOL_VERSION,
        capabilities: client_caps & server_caps,
        error: String::new(),
    }
}

/// Build the 6-byte server OK: "OK" version(2) negotiated(2)
pub fn create_ok(version: u16, caps: u16) -> Vec<u8> {
    let mut ok = Vec::with_capacity(6);
    ok.extend_from_slice(b"OK");
    ok.extend_from_slice(&version.to_be_bytes());
    ok.extend_from_slice(&caps.to_be_bytes());
    ok
}

/// Build a server ERROR frame: "ERROR" message NUL
pub fn create_error(msg: &str) -> Vec<u8> {
    let mut error = Vec::with_capacity(5 + msg.len() + 1);
    error.extend_from_slice(b"ERROR");
    error.extend_from_slice(msg.as_bytes());
    error.push(0);
    error
}

/// Parse the server's response to a HELLO (client side)
pub fn process_response(data: &[u8]) -> HandshakeResult {
    if data.len() < 2 {
        return HandshakeResult::rejected("Response too short");
    }

    if data.len() >= 6 && &data[..2] == b"OK" {
        return HandshakeResult {
            accepted: true,
            version: u16::from_be_bytes([data[2], data[3]]),
            capabilities: u16::from_be_bytes([data[4], data[5]]),
            error: String::new(),
        };
    }

    if data.len() >= 5 && &data[..5] == b"ERROR" {
        let msg = &data[5..];
        // Message runs to the NUL terminator or the end of the frame
        let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
        let text = String::from_utf8_lossy(&msg[..end]);
        return if text.is_empty() {
            HandshakeResult::rejected("Unknown error")
        } else {
            HandshakeResult::rejected(&text)
        };
    }

    HandshakeResult::rejected("Invalid response format")
}
