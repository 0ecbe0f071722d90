//! Headless protocol client
//!
//! Connects to a relay over any dialing transport, performs the handshake,
//! and frames incoming packets through a persistent receive buffer. Video
//! frames are reassembled internally: keyframes replace the current frame
//! buffer, delta frames XOR into it. Everything else is returned to the
//! caller as typed events. No rendering, no audio playback.

use crate::error::{Error, Result};
use crate::protocol::handshake::{self, PROTOCOL_VERSION};
use crate::protocol::packets::{
    AudioChunkPacket, InputEventPacket, PacketHeader, PacketType, VideoFramePacket, FLAG_DELTA,
    PACKET_HEADER_SIZE,
};
use crate::transport::{Connection, RecvResult, SendResult, Transport};
use log::{debug, info, warn};
use std::thread;
use std::time::Duration;

/// Attempts (at 10 ms each) to wait for the handshake response
const HANDSHAKE_ATTEMPTS: u32 = 100;

/// Stack buffer size for draining the socket
const RECEIVE_CHUNK: usize = 64 * 1024;

/// A decoded packet delivered by [`RelayClient::update`]
///
/// Video frames are absorbed into the client's frame buffer instead and
/// surface through [`RelayClient::take_frame`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    AudioChunk(AudioChunkPacket),
    InputEvent(InputEventPacket),
    Config(Vec<u8>),
    DebugInfo(Vec<u8>),
    Disconnected,
}

/// Protocol client with delta frame reassembly
pub struct RelayClient {
    connection: Box<dyn Connection>,
    connected: bool,
    server_capabilities: u16,
    receive_buffer: Vec<u8>,
    frame: Vec<u8>,
    frame_width: u16,
    frame_height: u16,
    frame_ready: bool,
}

impl RelayClient {
    /// Dial `address` through `transport` and complete the handshake
    ///
    /// Waits up to roughly one second for the server's response.
    pub fn connect(
        transport: &mut dyn Transport,
        address: &str,
        capabilities: u16,
    ) -> Result<Self> {
        let Some(mut connection) = transport.connect(address) else {
            return Err(Error::Transport(format!(
                "failed to connect to {}",
                address
            )));
        };

        let hello = handshake::create_hello(PROTOCOL_VERSION, capabilities);
        if !connection.send(&hello, true).is_complete(hello.len()) {
            return Err(Error::Protocol("failed to send handshake".to_string()));
        }

        let mut buf = [0u8; 1024];
        let mut received = 0usize;
        for _ in 0..HANDSHAKE_ATTEMPTS {
            match connection.receive(&mut buf) {
                RecvResult::Data(n) => {
                    received = n;
                    break;
                }
                RecvResult::WouldBlock => thread::sleep(Duration::from_millis(10)),
                RecvResult::Closed => {
                    return Err(Error::Protocol(
                        "connection closed during handshake".to_string(),
                    ));
                }
            }
        }

        if received == 0 {
            return Err(Error::Protocol("handshake timeout".to_string()));
        }

        let result = handshake::process_response(&buf[..received]);
        if !result.accepted {
            return Err(Error::Protocol(format!(
                "handshake rejected: {}",
                result.error
            )));
        }

        info!(
            "Connected to {}, negotiated caps 0x{:02X}",
            address, result.capabilities
        );

        Ok(Self {
            connection,
            connected: true,
            server_capabilities: result.capabilities,
            receive_buffer: Vec::new(),
            frame: Vec::new(),
            frame_width: 0,
            frame_height: 0,
            frame_ready: false,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Capabilities negotiated with the server
    pub fn server_capabilities(&self) -> u16 {
        self.server_capabilities
    }

    pub fn disconnect(&mut self) {
        self.connection.close();
        self.connected = false;
    }

    /// Drain the socket and decode complete packets
    ///
    /// Returns non-video events in arrival order. Video frames update the
    /// internal frame buffer; pick them up with [`RelayClient::take_frame`].
    pub fn update(&mut self) -> Vec<ClientEvent> {
        let mut events = Vec::new();
        if !self.connected {
            return events;
        }

        let mut chunk = [0u8; RECEIVE_CHUNK];
        loop {
            match self.connection.receive(&mut chunk) {
                RecvResult::Data(n) => {
                    self.receive_buffer.extend_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        break;
                    }
                }
                RecvResult::WouldBlock => break,
                RecvResult::Closed => {
                    self.connected = false;
                    events.push(ClientEvent::Disconnected);
                    break;
                }
            }
        }

        while self.receive_buffer.len() >= PACKET_HEADER_SIZE {
            let header = PacketHeader::parse(&self.receive_buffer);
            let total = PACKET_HEADER_SIZE + header.length as usize;
            if self.receive_buffer.len() < total {
                break;
            }

            let payload: Vec<u8> = self.receive_buffer[PACKET_HEADER_SIZE..total].to_vec();
            self.receive_buffer.drain(..total);
            self.handle_packet(&header, &payload, &mut events);
        }

        events
    }

    /// The latest reassembled frame, if one arrived since the last call
    ///
    /// Readiness resets on every call so the same frame is never uploaded
    /// twice.
    pub fn take_frame(&mut self) -> Option<&[u8]> {
        if self.frame_ready {
            self.frame_ready = false;
            Some(&self.frame)
        } else {
            None
        }
    }

    /// Dimensions of the current frame buffer
    pub fn frame_size(&self) -> (u16, u16) {
        (self.frame_width, self.frame_height)
    }

    pub fn send_video_frame(&mut self, packet: &VideoFramePacket) -> bool {
        let flags = if packet.is_delta { FLAG_DELTA } else { 0 };
        self.send_packet(PacketType::VideoFrame, flags, &packet.serialize(), false)
    }

    pub fn send_audio_chunk(&mut self, packet: &AudioChunkPacket) -> bool {
        self.send_packet(PacketType::AudioChunk, 0, &packet.serialize(), true)
    }

    pub fn send_input(&mut self, packet: &InputEventPacket) -> bool {
        self.send_packet(PacketType::InputEvent, 0, &packet.serialize(), true)
    }

    pub fn send_config(&mut self, data: &[u8]) -> bool {
        self.send_packet(PacketType::Config, 0, data, true)
    }

    /// Header and payload leave in one buffer, same as the server side, so
    /// WebSocket peers see exactly one frame per packet
    fn send_packet(
        &mut self,
        packet_type: PacketType,
        flags: u8,
        payload: &[u8],
        reliable: bool,
    ) -> bool {
        if !self.connected {
            return false;
        }

        let header = PacketHeader::new(packet_type, flags, payload.len() as u32);
        let mut frame = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.serialize());
        frame.extend_from_slice(payload);

        match self.connection.send(&frame, reliable) {
            SendResult::Sent(sent) => sent == frame.len(),
            SendResult::Dropped => false,
            SendResult::Closed => {
                self.connected = false;
                false
            }
        }
    }

    fn handle_packet(
        &mut self,
        header: &PacketHeader,
        payload: &[u8],
        events: &mut Vec<ClientEvent>,
    ) {
        match header.kind() {
            Some(PacketType::VideoFrame) => {
                let mut packet = VideoFramePacket::parse(payload);
                packet.is_delta = header.flags & FLAG_DELTA != 0;
                self.apply_video_frame(packet);
            }
            Some(PacketType::AudioChunk) => {
                events.push(ClientEvent::AudioChunk(AudioChunkPacket::parse(payload)));
            }
            Some(PacketType::InputEvent) => {
                events.push(ClientEvent::InputEvent(InputEventPacket::parse(payload)));
            }
            Some(PacketType::Config) => {
                events.push(ClientEvent::Config(payload.to_vec()));
            }
            Some(PacketType::DebugInfo) => {
                events.push(ClientEvent::DebugInfo(payload.to_vec()));
            }
            None => {
                debug!("Unknown packet type 0x{:02X}, skipping", header.packet_type);
            }
        }
    }

    fn apply_video_frame(&mut self, packet: VideoFramePacket) {
        if packet.is_delta {
            // A delta only makes sense against a keyframe of the same size
            if !self.frame.is_empty() && packet.data.len() == self.frame.len() {
                VideoFramePacket::apply_delta(&mut self.frame, &packet.data);
                self.frame_ready = true;
            } else {
                warn!(
                    "Delta frame of {} bytes does not match keyframe of {} bytes, dropping",
                    packet.data.len(),
                    self.frame.len()
                );
                return;
            }
        } else {
            self.frame = packet.data;
            self.frame_ready = true;
        }

        self.frame_width = packet.width;
        self.frame_height = packet.height;
    }
}
