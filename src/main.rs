//! PerunRelay - Multi-transport streaming relay daemon
//!
//! Listens on any combination of UNIX socket, TCP and WebSocket transports
//! and rebroadcasts every packet a client sends to all other handshaked
//! clients: video unreliably (frames may drop under backpressure), audio
//! reliably to peers that negotiated the AUDIO capability, input reliably
//! to everyone.

use clap::Parser;
use log::{debug, error, info};
use perun_relay::protocol::{AudioChunkPacket, InputEventPacket, VideoFramePacket};
use perun_relay::server::{Server, ServerCallbacks};
use perun_relay::transport::{TcpTransport, Transport, UnixTransport, WebSocketTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Default UNIX listener when no transport flags are given
const DEFAULT_UNIX_PATH: &str = "/tmp/perun.sock";
/// Default TCP listener when no transport flags are given
const DEFAULT_TCP_ADDRESS: &str = ":8080";

/// Poll timeout between update passes
const POLL_TIMEOUT_MS: i32 = 10;

/// Multi-transport streaming relay for emulator video, audio and input
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Add a UNIX socket listener at this path (repeatable)
    #[arg(short = 'u', long = "unix", value_name = "PATH")]
    unix: Vec<String>,

    /// Add a TCP listener at host:port or :port (repeatable)
    #[arg(short = 't', long = "tcp", value_name = "HOST:PORT")]
    tcp: Vec<String>,

    /// Add a WebSocket listener at host:port or :port (repeatable)
    #[arg(short = 'w', long = "ws", value_name = "HOST:PORT")]
    ws: Vec<String>,
}

/// Relay policy: everything a client sends goes back out to the other
/// clients, never to the sender
struct RelayHandler;

impl ServerCallbacks for RelayHandler {
    fn on_client_connected(&mut self, _server: &mut Server, client_id: u32, capabilities: u16) {
        info!(
            "Client {} connected, caps 0x{:02X}",
            client_id, capabilities
        );
    }

    fn on_client_disconnected(&mut self, _server: &mut Server, client_id: u32) {
        info!("Client {} disconnected", client_id);
    }

    fn on_video_frame(&mut self, server: &mut Server, client_id: u32, packet: &VideoFramePacket) {
        server.broadcast_video_frame(packet, Some(client_id));
    }

    fn on_audio_chunk(&mut self, server: &mut Server, client_id: u32, packet: &AudioChunkPacket) {
        server.broadcast_audio_chunk(packet, Some(client_id));
    }

    fn on_input_event(&mut self, server: &mut Server, client_id: u32, packet: &InputEventPacket) {
        server.broadcast_input_event(packet, Some(client_id));
    }

    fn on_config(&mut self, _server: &mut Server, client_id: u32, data: &[u8]) {
        debug!("Client {}: config packet of {} bytes", client_id, data.len());
    }

    fn on_debug_info(&mut self, _server: &mut Server, client_id: u32, data: &[u8]) {
        debug!("Client {}: debug info of {} bytes", client_id, data.len());
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("PerunRelay v{} starting...", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();
    let mut server = Server::new();

    // Collect requested listeners; fall back to the defaults when none given
    let mut listeners: Vec<(Box<dyn Transport>, String)> = Vec::new();
    for path in &args.unix {
        listeners.push((Box::new(UnixTransport::new()), path.clone()));
    }
    for address in &args.tcp {
        listeners.push((Box::new(TcpTransport::new()), address.clone()));
    }
    for address in &args.ws {
        listeners.push((Box::new(WebSocketTransport::new()), address.clone()));
    }
    if listeners.is_empty() {
        listeners.push((
            Box::new(UnixTransport::new()),
            DEFAULT_UNIX_PATH.to_string(),
        ));
        listeners.push((Box::new(TcpTransport::new()), DEFAULT_TCP_ADDRESS.to_string()));
    }

    for (transport, address) in listeners {
        if let Err(e) = server.add_transport(transport, &address) {
            error!("{}", e);
            std::process::exit(1);
        }
    }

    if let Err(e) = server.start() {
        error!("{}", e);
        std::process::exit(1);
    }

    // Shutdown flag flipped by Ctrl-C / SIGTERM
    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::Relaxed);
    }) {
        error!("Error setting Ctrl-C handler: {}", e);
        std::process::exit(1);
    }

    info!("Relay running. Press Ctrl-C to stop.");

    let mut handler = RelayHandler;
    while running.load(Ordering::Relaxed) {
        server.update(&mut handler);
        server.poll(POLL_TIMEOUT_MS);
    }

    server.stop(&mut handler);
    info!("PerunRelay stopped");
}
