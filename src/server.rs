//! Multi-transport streaming server
//!
//! The server owns any number of listening transports and one `ClientState`
//! per accepted connection. A single call to [`Server::update`] drains the
//! listeners, reads every client socket into its receive buffer, settles
//! handshakes, frames complete packets, dispatches them to the callback
//! object, and sweeps out closed clients. [`Server::poll`] blocks on
//! readiness of every descriptor so an idle relay does not busy-loop.
//!
//! The core is single-threaded cooperative: all state mutation happens on
//! the thread calling `update`/`poll`/`stop`, and callbacks run
//! synchronously inside `update`. Callbacks receive `&mut Server` so they
//! can re-enter the send and broadcast API; they must not call
//! [`Server::add_transport`], [`Server::start`] or [`Server::stop`].

use crate::error::{Error, Result};
use crate::protocol::handshake::{self, CAP_AUDIO, CAP_DEBUG, CAP_DELTA};
use crate::protocol::packets::{
    AudioChunkPacket, InputEventPacket, PacketHeader, PacketType, VideoFramePacket, FLAG_DELTA,
    PACKET_HEADER_SIZE,
};
use crate::transport::{Connection, RecvResult, SendResult, Transport};
use log::{debug, info, warn};
use std::time::Duration;

/// Capabilities offered to every client: delta frames, audio, debug info
pub const DEFAULT_SERVER_CAPS: u16 = CAP_DELTA | CAP_AUDIO | CAP_DEBUG;

/// A header claiming more than this is a framing error, not a packet
const MAX_PACKET_BYTES: u32 = 16 * 1024 * 1024;

/// Stack buffer size for draining client sockets
const RECEIVE_CHUNK: usize = 64 * 1024;

/// Event sink for server activity
///
/// All methods run synchronously inside [`Server::update`] on the calling
/// thread. The `server` parameter allows re-entering the send/broadcast API;
/// lifecycle methods (`add_transport`, `start`, `stop`) are off limits from
/// here.
pub trait ServerCallbacks {
    /// A client completed the handshake
    fn on_client_connected(&mut self, server: &mut Server, client_id: u32, capabilities: u16);

    /// A handshaked client's connection closed
    fn on_client_disconnected(&mut self, server: &mut Server, client_id: u32);

    fn on_video_frame(&mut self, server: &mut Server, client_id: u32, packet: &VideoFramePacket);

    fn on_audio_chunk(&mut self, server: &mut Server, client_id: u32, packet: &AudioChunkPacket);

    fn on_input_event(&mut self, server: &mut Server, client_id: u32, packet: &InputEventPacket);

    fn on_config(&mut self, server: &mut Server, client_id: u32, data: &[u8]);

    fn on_debug_info(&mut self, _server: &mut Server, _client_id: u32, _data: &[u8]) {}
}

/// Per-client state, owned exclusively by the server
struct ClientState {
    id: u32,
    connection: Box<dyn Connection>,
    capabilities: u16,
    receive_buffer: Vec<u8>,
    handshake_complete: bool,
}

/// Multi-transport relay server
pub struct Server {
    transports: Vec<Box<dyn Transport>>,
    clients: Vec<ClientState>,
    next_client_id: u32,
    running: bool,
    server_capabilities: u16,
    in_update: bool,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self {
            transports: Vec::new(),
            clients: Vec::new(),
            next_client_id: 1,
            running: false,
            server_capabilities: DEFAULT_SERVER_CAPS,
            in_update: false,
        }
    }

    /// Add a transport and start listening on it immediately
    ///
    /// Only allowed before [`Server::start`]. On failure the transport is
    /// not registered and the server configuration is unchanged.
    pub fn add_transport(
        &mut self,
        mut transport: Box<dyn Transport>,
        address: &str,
    ) -> Result<()> {
        debug_assert!(!self.in_update, "add_transport called from a callback");
        if self.running {
            return Err(Error::Transport(
                "cannot add transports while the server is running".to_string(),
            ));
        }

        transport.listen(address)?;
        self.transports.push(transport);
        info!("Added transport listening on {}", address);
        Ok(())
    }

    /// Enter the running state. Requires at least one listening transport.
    pub fn start(&mut self) -> Result<()> {
        debug_assert!(!self.in_update, "start called from a callback");
        if self.running {
            return Ok(());
        }
        if self.transports.is_empty() {
            return Err(Error::Transport("no transports configured".to_string()));
        }

        self.running = true;
        info!("Server started with {} transport(s)", self.transports.len());
        Ok(())
    }

    /// Close every client and transport and leave the running state
    ///
    /// Disconnect callbacks fire for clients that had completed the
    /// handshake.
    pub fn stop(&mut self, callbacks: &mut dyn ServerCallbacks) {
        debug_assert!(!self.in_update, "stop called from a callback");
        if !self.running {
            return;
        }

        info!("Stopping server");

        let mut clients = std::mem::take(&mut self.clients);
        for client in &mut clients {
            client.connection.close();
        }
        for client in &clients {
            if client.handshake_complete {
                callbacks.on_client_disconnected(self, client.id);
            }
        }

        for transport in &mut self.transports {
            transport.close();
        }

        self.running = false;
        info!("Server stopped");
    }

    /// Process pending events: accept connections, read sockets, settle
    /// handshakes, dispatch packets, sweep closed clients
    pub fn update(&mut self, callbacks: &mut dyn ServerCallbacks) {
        debug_assert!(!self.in_update, "update called from a callback");
        if !self.running {
            return;
        }

        self.in_update = true;

        self.accept_new_connections();

        let mut index = 0;
        while index < self.clients.len() {
            self.process_client(index, callbacks);
            index += 1;
        }

        self.sweep_closed_clients(callbacks);

        self.in_update = false;
    }

    /// Wait for readiness on any listener or client, up to `timeout_ms`
    ///
    /// With no descriptors to watch the call sleeps for the timeout so an
    /// idle server does not spin. Returns the number of ready descriptors.
    pub fn poll(&mut self, timeout_ms: i32) -> usize {
        if !self.running {
            return 0;
        }

        let mut fds: Vec<libc::pollfd> = Vec::new();

        for transport in &self.transports {
            let fd = transport.listen_descriptor();
            if fd >= 0 {
                fds.push(libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
        }

        for client in &self.clients {
            if client.connection.is_open() {
                let fd = client.connection.descriptor();
                if fd >= 0 {
                    fds.push(libc::pollfd {
                        fd,
                        events: libc::POLLIN,
                        revents: 0,
                    });
                }
            }
        }

        if fds.is_empty() {
            if timeout_ms > 0 {
                std::thread::sleep(Duration::from_millis(timeout_ms as u64));
            }
            return 0;
        }

        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if ready > 0 {
            ready as usize
        } else {
            0
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    // ========================================================================
    // Send API
    // ========================================================================

    /// Send a video frame to one client, unreliably: under backpressure the
    /// frame is dropped and `false` returned, the connection stays open
    pub fn send_video_frame(&mut self, client_id: u32, packet: &VideoFramePacket) -> bool {
        let Some(index) = self.client_index(client_id) else {
            return false;
        };
        let flags = if packet.is_delta { FLAG_DELTA } else { 0 };
        self.send_packet(index, PacketType::VideoFrame, flags, &packet.serialize(), false)
    }

    /// Send a video frame to every handshaked client except `exclude_id`
    pub fn broadcast_video_frame(&mut self, packet: &VideoFramePacket, exclude_id: Option<u32>) {
        let payload = packet.serialize();
        let flags = if packet.is_delta { FLAG_DELTA } else { 0 };

        for index in 0..self.clients.len() {
            let client = &self.clients[index];
            if !client.handshake_complete || Some(client.id) == exclude_id {
                continue;
            }
            self.send_packet(index, PacketType::VideoFrame, flags, &payload, false);
        }
    }

    /// Send an audio chunk to one client, reliably
    pub fn send_audio_chunk(&mut self, client_id: u32, packet: &AudioChunkPacket) -> bool {
        let Some(index) = self.client_index(client_id) else {
            return false;
        };
        self.send_packet(index, PacketType::AudioChunk, 0, &packet.serialize(), true)
    }

    /// Send an audio chunk to every handshaked client that negotiated the
    /// AUDIO capability, except `exclude_id`. Reliable: audio gaps are more
    /// disruptive than video drops.
    pub fn broadcast_audio_chunk(&mut self, packet: &AudioChunkPacket, exclude_id: Option<u32>) {
        let payload = packet.serialize();

        for index in 0..self.clients.len() {
            let client = &self.clients[index];
            if !client.handshake_complete
                || client.capabilities & CAP_AUDIO == 0
                || Some(client.id) == exclude_id
            {
                continue;
            }
            self.send_packet(index, PacketType::AudioChunk, 0, &payload, true);
        }
    }

    /// Send an input event to every handshaked client except `exclude_id`,
    /// reliably
    pub fn broadcast_input_event(&mut self, packet: &InputEventPacket, exclude_id: Option<u32>) {
        let payload = packet.serialize();

        for index in 0..self.clients.len() {
            let client = &self.clients[index];
            if !client.handshake_complete || Some(client.id) == exclude_id {
                continue;
            }
            self.send_packet(index, PacketType::InputEvent, 0, &payload, true);
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn client_index(&self, client_id: u32) -> Option<usize> {
        self.clients.iter().position(|c| c.id == client_id)
    }

    /// Frame and send one packet. Header and payload go out in a single
    /// buffer: the WebSocket backend wraps each send in its own frame, so
    /// two sends would split the packet across frame boundaries at the peer.
    fn send_packet(
        &mut self,
        index: usize,
        packet_type: PacketType,
        flags: u8,
        payload: &[u8],
        reliable: bool,
    ) -> bool {
        let client = &mut self.clients[index];
        if !client.handshake_complete || !client.connection.is_open() {
            return false;
        }

        let header = PacketHeader::new(packet_type, flags, payload.len() as u32);
        let mut frame = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.serialize());
        frame.extend_from_slice(payload);

        match client.connection.send(&frame, reliable) {
            SendResult::Sent(sent) => sent == frame.len(),
            SendResult::Dropped => false,
            SendResult::Closed => false,
        }
    }

    fn accept_new_connections(&mut self) {
        for transport in &mut self.transports {
            while let Some(connection) = transport.accept() {
                let id = self.next_client_id;
                self.next_client_id += 1;

                self.clients.push(ClientState {
                    id,
                    connection,
                    capabilities: 0,
                    receive_buffer: Vec::new(),
                    handshake_complete: false,
                });

                info!("New connection, client id {}", id);
            }
        }
    }

    fn process_client(&mut self, index: usize, callbacks: &mut dyn ServerCallbacks) {
        let mut chunk = [0u8; RECEIVE_CHUNK];
        let mut received_any = false;

        {
            let client = &mut self.clients[index];
            if !client.connection.is_open() {
                return;
            }

            loop {
                match client.connection.receive(&mut chunk) {
                    RecvResult::Data(n) => {
                        client.receive_buffer.extend_from_slice(&chunk[..n]);
                        received_any = true;
                        // A short read usually means the socket is drained
                        if n < chunk.len() {
                            break;
                        }
                    }
                    RecvResult::WouldBlock => break,
                    // The sweep fires the disconnect callback
                    RecvResult::Closed => return,
                }
            }

            if !received_any {
                return;
            }
        }

        if !self.clients[index].handshake_complete {
            self.process_handshake(index, callbacks);
        } else {
            self.process_packets(index, callbacks);
        }
    }

    fn process_handshake(&mut self, index: usize, callbacks: &mut dyn ServerCallbacks) {
        if self.clients[index].receive_buffer.len() < handshake::HELLO_SIZE {
            return;
        }

        let result = handshake::process_hello(
            &self.clients[index].receive_buffer,
            self.server_capabilities,
        );

        if !result.accepted {
            let client = &mut self.clients[index];
            warn!("Client {} handshake failed: {}", client.id, result.error);
            let _ = client
                .connection
                .send(&handshake::create_error(&result.error), true);
            client.connection.close();
            return;
        }

        let response = handshake::create_ok(result.version, result.capabilities);
        let client = &mut self.clients[index];
        let id = client.id;

        if !client.connection.send(&response, true).is_complete(response.len()) {
            client.connection.close();
            return;
        }

        client.capabilities = result.capabilities;
        client.handshake_complete = true;
        client.receive_buffer.clear();
        info!(
            "Client {} handshake complete, caps 0x{:02X}",
            id, result.capabilities
        );

        callbacks.on_client_connected(self, id, result.capabilities);
    }

    fn process_packets(&mut self, index: usize, callbacks: &mut dyn ServerCallbacks) {
        let mut buffer = std::mem::take(&mut self.clients[index].receive_buffer);
        let mut offset = 0usize;

        while buffer.len() - offset >= PACKET_HEADER_SIZE {
            if !self.clients[index].connection.is_open() {
                break;
            }

            let header = PacketHeader::parse(&buffer[offset..]);

            if header.length > MAX_PACKET_BYTES {
                warn!(
                    "Client {}: implausible packet length {}, closing",
                    self.clients[index].id, header.length
                );
                self.clients[index].connection.close();
                offset = buffer.len();
                break;
            }

            let total = PACKET_HEADER_SIZE + header.length as usize;
            if buffer.len() - offset < total {
                // Wait for the rest of the packet
                break;
            }

            let client_id = self.clients[index].id;
            let payload = &buffer[offset + PACKET_HEADER_SIZE..offset + total];
            self.dispatch_packet(callbacks, client_id, &header, payload);

            offset += total;
        }

        buffer.drain(..offset);
        self.clients[index].receive_buffer = buffer;
    }

    fn dispatch_packet(
        &mut self,
        callbacks: &mut dyn ServerCallbacks,
        client_id: u32,
        header: &PacketHeader,
        payload: &[u8],
    ) {
        match header.kind() {
            Some(PacketType::VideoFrame) => {
                let mut packet = VideoFramePacket::parse(payload);
                packet.is_delta = header.flags & FLAG_DELTA != 0;
                callbacks.on_video_frame(self, client_id, &packet);
            }
            Some(PacketType::AudioChunk) => {
                let packet = AudioChunkPacket::parse(payload);
                callbacks.on_audio_chunk(self, client_id, &packet);
            }
            Some(PacketType::InputEvent) => {
                let packet = InputEventPacket::parse(payload);
                callbacks.on_input_event(self, client_id, &packet);
            }
            Some(PacketType::Config) => {
                callbacks.on_config(self, client_id, payload);
            }
            Some(PacketType::DebugInfo) => {
                callbacks.on_debug_info(self, client_id, payload);
            }
            None => {
                debug!(
                    "Client {}: unknown packet type 0x{:02X}, skipping {} bytes",
                    client_id, header.packet_type, header.length
                );
            }
        }
    }

    fn sweep_closed_clients(&mut self, callbacks: &mut dyn ServerCallbacks) {
        let mut index = 0;
        while index < self.clients.len() {
            if self.clients[index].connection.is_open() {
                index += 1;
                continue;
            }

            // Removed before the callback runs so a re-entrant broadcast
            // cannot reach the departing client
            let client = self.clients.remove(index);
            info!("Client {} disconnected", client.id);
            if client.handshake_complete {
                callbacks.on_client_disconnected(self, client.id);
            }
        }
    }
}
