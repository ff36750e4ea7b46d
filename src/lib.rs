//! # packetwire
//!
//! Point-to-point binary packet transport over TCP.
//!
//! Every message is a self-delimiting frame:
//!
//! ```text
//! ┌────────┬────────┬─────────┬─────────┬─────────┬──────────┬──────┐
//! │ Header │ Length │ Command │ Options │ Payload │ Checksum │ Tail │
//! │ 3 B    │ 4 B LE │ 1 B     │ 1 B     │ N B     │ 1 B XOR  │ 2 B  │
//! └────────┴────────┴─────────┴─────────┴─────────┴──────────┴──────┘
//! ```
//!
//! The options byte asks the receiver for an acknowledgement (bit 0) or a
//! response (bit 1). Markers, length width and the payload limit are set by
//! [`protocol::PacketConfig`] and must match on both ends.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use packetwire::{CancelToken, Client, ClientConfig, Server, ServerConfig};
//!
//! # async fn run() -> packetwire::Result<()> {
//! let server = Arc::new(Server::bind(ServerConfig {
//!     addr: "127.0.0.1:0".parse().unwrap(),
//!     ..Default::default()
//! })?);
//! let addr = server.local_addr();
//!
//! let srv = Arc::clone(&server);
//! tokio::spawn(async move { srv.start(&CancelToken::new()).await });
//!
//! let client = Client::new(ClientConfig {
//!     remote_addr: addr,
//!     ..Default::default()
//! });
//! let result = client
//!     .send_command_with_options(0xAA, 0x01, vec![1, 0, 0, 0], &CancelToken::new())
//!     .await?;
//! assert!(result.sent);
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod client;
pub mod error;
pub mod events;
pub mod protocol;
pub mod reassembler;
pub mod server;
pub mod writer;

pub use cancel::CancelToken;
pub use client::{Client, ClientConfig, SendResult};
pub use error::{Result, WireError};
pub use events::{ClientEvent, ClientEvents, ConnectionId, NoopEvents, ServerEvent, ServerEvents};
pub use server::{Server, ServerConfig};
