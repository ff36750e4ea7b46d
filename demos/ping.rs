//! Ping - acknowledged commands between a local server and client.
//!
//! This example demonstrates:
//! - Binding a server on an ephemeral port and observing its events
//! - Sending acknowledged and fire-and-forget commands
//! - Shutting both endpoints down
//!
//! # Running
//!
//! ```text
//! RUST_LOG=packetwire=debug cargo run --example ping
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use packetwire::protocol::{CommandOptions, Packet};
use packetwire::{
    CancelToken, Client, ClientConfig, ConnectionId, Server, ServerConfig, ServerEvents,
};

/// Prints every packet the server accepts.
struct Printer;

impl ServerEvents for Printer {
    fn connected(&self, id: ConnectionId, peer: SocketAddr) {
        println!("{id} connected from {peer}");
    }

    fn packet_received(&self, id: ConnectionId, packet: &Packet) {
        println!(
            "{id}: command {:#04x}, options {:#04x}, payload {:?}",
            packet.command(),
            packet.options_byte(),
            packet.payload()
        );
    }

    fn disconnected(&self, id: ConnectionId) {
        println!("{id} disconnected");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let server = Arc::new(Server::bind_with_events(
        ServerConfig {
            addr: "127.0.0.1:0".parse()?,
            ..Default::default()
        },
        Arc::new(Printer),
    )?);
    let srv = Arc::clone(&server);
    let accept = tokio::spawn(async move { srv.start(&CancelToken::new()).await });

    let client = Client::new(ClientConfig {
        remote_addr: server.local_addr(),
        ..Default::default()
    });
    let cancel = CancelToken::new();

    let ack = CommandOptions::new().ack_required(true).build();
    for seq in 0u32..3 {
        let result = client
            .send_command_with_options(0xAA, ack, seq.to_le_bytes().to_vec(), &cancel)
            .await?;
        println!("ping {seq}: acknowledged = {}", result.sent);
    }

    let result = client.send_command(0x01, &b"bye"[..], &cancel).await?;
    println!("fire-and-forget sent = {}", result.sent);

    client.close().await;
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    server.shutdown();
    accept.await??;
    Ok(())
}
