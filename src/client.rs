//! Client endpoint.
//!
//! A [`Client`] owns one outbound connection and sends commands over it:
//! 1. Connect (with a retry budget) if not connected
//! 2. Write the encoded packet
//! 3. Return immediately for fire-and-forget options
//! 4. Otherwise read until a valid reply frame has been accumulated
//! 5. Accept the reply if a response was requested, or if it is exactly
//!    the acknowledgement frame
//!
//! Transport errors, including a reply timeout, re-enter the whole exchange
//! on a fresh connection up to the send budget. Protocol failures are
//! terminal. A connection is only kept after a successful exchange.
//! Callers always get a [`SendResult`]; failures are never raised as errors.
//!
//! Sends on one client are serialized, so each reply is attributed to the
//! request that caused it.
//!
//! # Example
//!
//! ```no_run
//! use packetwire::{CancelToken, Client, ClientConfig};
//! use packetwire::protocol::CommandOptions;
//!
//! # async fn run() -> packetwire::Result<()> {
//! let client = Client::new(ClientConfig {
//!     remote_addr: "127.0.0.1:11000".parse().unwrap(),
//!     ..Default::default()
//! });
//!
//! let options = CommandOptions::new().ack_required(true).build();
//! let result = client
//!     .send_command_with_options(0xAA, options, vec![1, 0, 0, 0], &CancelToken::new())
//!     .await?;
//! assert!(result.sent);
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::error::{Result, WireError};
use crate::events::{ClientEvents, NoopEvents};
use crate::protocol::{parse_from_tail, Packet, PacketConfig};

/// Default connect attempts before a send fails.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 10;

/// Default attempts of the whole write/read exchange.
pub const DEFAULT_SEND_ATTEMPTS: u32 = 10;

/// Default follow-up reads while accumulating a reply.
pub const DEFAULT_RECEIVE_ATTEMPTS: u32 = 10;

/// Default delay between attempts.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Default wait for the first reply bytes.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default wait for each follow-up read of a partial reply.
pub const DEFAULT_RECEIVE_POLL: Duration = Duration::from_millis(500);

/// Default read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Configuration for [`Client`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address. Default: `127.0.0.1:11000`.
    pub remote_addr: SocketAddr,
    /// Local address to bind before connecting (ephemeral port).
    pub local_addr: Option<IpAddr>,
    /// Framing shared with the server.
    pub packet: PacketConfig,
    pub connect_attempts: u32,
    pub send_attempts: u32,
    pub receive_attempts: u32,
    pub retry_delay: Duration,
    pub reply_timeout: Duration,
    pub receive_poll: Duration,
    pub read_buffer_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            remote_addr: SocketAddr::from(([127, 0, 0, 1], 11000)),
            local_addr: None,
            packet: PacketConfig::default(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            send_attempts: DEFAULT_SEND_ATTEMPTS,
            receive_attempts: DEFAULT_RECEIVE_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            receive_poll: DEFAULT_RECEIVE_POLL,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

/// Outcome of a send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResult {
    /// The packet was written and any required reply was valid.
    pub sent: bool,
    /// Payload of the reply when a response was requested.
    pub response: Bytes,
}

impl SendResult {
    fn failed() -> Self {
        Self::default()
    }

    fn delivered(response: Bytes) -> Self {
        Self {
            sent: true,
            response,
        }
    }
}

#[derive(Debug, Error)]
enum SendFailure {
    #[error("could not connect after {0} attempts")]
    Connect(u32),
    #[error("transport error: {0}")]
    Transport(#[from] WireError),
    #[error("{0}")]
    Protocol(&'static str),
    #[error("cancelled")]
    Cancelled,
    #[error("gave up after {0} attempts")]
    Exhausted(u32),
}

impl From<std::io::Error> for SendFailure {
    fn from(e: std::io::Error) -> Self {
        SendFailure::Transport(WireError::Io(e))
    }
}

/// Client endpoint holding at most one connection.
pub struct Client {
    config: ClientConfig,
    events: Arc<dyn ClientEvents>,
    ack: Bytes,
    stream: Mutex<Option<TcpStream>>,
}

impl Client {
    /// Create a client without observers. Connection is deferred to the
    /// first send.
    pub fn new(config: ClientConfig) -> Self {
        Self::with_events(config, Arc::new(NoopEvents))
    }

    /// Create a client reporting to `events`.
    pub fn with_events(config: ClientConfig, events: Arc<dyn ClientEvents>) -> Self {
        Self {
            ack: Packet::ack(&config.packet).encode(),
            config,
            events,
            stream: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Build a packet with this client's framing.
    pub fn create_command(&self, command: u8, options: u8, payload: impl Into<Bytes>) -> Result<Packet> {
        Packet::compose(&self.config.packet, command, options, payload)
    }

    /// Send a fire-and-forget command.
    pub async fn send_command(
        &self,
        command: u8,
        payload: impl Into<Bytes>,
        cancel: &CancelToken,
    ) -> Result<SendResult> {
        self.send_command_with_options(command, 0x00, payload, cancel)
            .await
    }

    /// Send a command with an explicit options byte.
    ///
    /// # Errors
    ///
    /// Only [`WireError::PayloadTooLarge`]; delivery failures are reported
    /// through the returned [`SendResult`].
    pub async fn send_command_with_options(
        &self,
        command: u8,
        options: u8,
        payload: impl Into<Bytes>,
        cancel: &CancelToken,
    ) -> Result<SendResult> {
        let packet = self.create_command(command, options, payload)?;
        Ok(self.send(&packet, cancel).await)
    }

    /// Send a pre-built packet.
    pub async fn send(&self, packet: &Packet, cancel: &CancelToken) -> SendResult {
        tracing::trace!(
            "Sending command {:#04x} with options {:#04x} and {} byte payload",
            packet.command(),
            packet.options_byte(),
            packet.payload().len()
        );

        let mut stream = self.stream.lock().await;
        match self.send_locked(&mut stream, packet, cancel).await {
            Ok(result) => {
                self.events.packet_sent(packet, self.config.remote_addr);
                result
            }
            Err(failure) => {
                tracing::error!(
                    "Failed to send command {:#04x} to {}: {}",
                    packet.command(),
                    self.config.remote_addr,
                    failure
                );
                self.events
                    .packet_failed_to_send(packet, self.config.remote_addr);
                SendResult::failed()
            }
        }
    }

    /// Shut down and release the connection. Errors are ignored.
    pub async fn close(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!("Ignoring shutdown error: {}", e);
            }
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.stream.lock().await.is_some()
    }

    async fn send_locked(
        &self,
        slot: &mut Option<TcpStream>,
        packet: &Packet,
        cancel: &CancelToken,
    ) -> std::result::Result<SendResult, SendFailure> {
        let attempts = self.config.send_attempts.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SendFailure::Cancelled);
            }

            let mut stream = match slot.take() {
                Some(stream) => stream,
                None => self.connect_with_retry(cancel).await?,
            };

            // After a failed exchange a late reply may still be in flight, so
            // the stream is never reused: the next attempt or send reconnects.
            match self.exchange(&mut stream, packet, cancel).await {
                Ok(result) => {
                    *slot = Some(stream);
                    return Ok(result);
                }
                Err(SendFailure::Transport(e)) => {
                    tracing::warn!("Send attempt {}/{} failed: {}", attempt, attempts, e);
                    drop(stream);
                    if !cancel.sleep(self.config.retry_delay).await {
                        return Err(SendFailure::Cancelled);
                    }
                }
                Err(other) => return Err(other),
            }
        }

        Err(SendFailure::Exhausted(attempts))
    }

    async fn connect_with_retry(
        &self,
        cancel: &CancelToken,
    ) -> std::result::Result<TcpStream, SendFailure> {
        let attempts = self.config.connect_attempts.max(1);

        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(SendFailure::Cancelled);
            }
            match self.connect().await {
                Ok(stream) => {
                    tracing::debug!("Connected to {}", self.config.remote_addr);
                    return Ok(stream);
                }
                Err(e) => {
                    tracing::debug!(
                        "Connect attempt {}/{} to {} failed: {}",
                        attempt,
                        attempts,
                        self.config.remote_addr,
                        e
                    );
                    if !cancel.sleep(self.config.retry_delay).await {
                        return Err(SendFailure::Cancelled);
                    }
                }
            }
        }

        Err(SendFailure::Connect(attempts))
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        let remote = self.config.remote_addr;
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        if let Some(ip) = self.config.local_addr {
            socket.bind(SocketAddr::new(ip, 0))?;
        }

        let stream = tokio::time::timeout(self.config.reply_timeout, socket.connect(remote))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// One write plus, when required, one reply.
    async fn exchange(
        &self,
        stream: &mut TcpStream,
        packet: &Packet,
        cancel: &CancelToken,
    ) -> std::result::Result<SendResult, SendFailure> {
        let bytes = packet.encode();
        stream.write_all(&bytes).await?;
        tracing::trace!("Sent {} bytes", bytes.len());
        self.events.data_sent(bytes.len(), self.config.remote_addr);

        let options = packet.options();
        if !options.expects_reply() {
            return Ok(SendResult::delivered(Bytes::new()));
        }

        let reply = self.receive(stream, cancel).await?;

        if options.is_response_required() {
            return Ok(SendResult::delivered(reply.payload_bytes()));
        }
        if reply.encode() == self.ack {
            return Ok(SendResult::delivered(Bytes::new()));
        }
        Err(SendFailure::Protocol("reply is not the acknowledgement frame"))
    }

    /// Read until the accumulated bytes form exactly one valid frame.
    async fn receive(
        &self,
        stream: &mut TcpStream,
        cancel: &CancelToken,
    ) -> std::result::Result<Packet, SendFailure> {
        let mut buf = vec![0u8; self.config.read_buffer_size.max(1)];
        let mut cache: Vec<u8> = Vec::new();

        // First read waits for the reply; follow-ups only drain what is
        // still in flight.
        let mut wait = self.config.reply_timeout;
        let mut follow_ups = 0;

        loop {
            let read = tokio::select! {
                read = tokio::time::timeout(wait, stream.read(&mut buf)) => read,
                _ = cancel.cancelled() => return Err(SendFailure::Cancelled),
            };

            match read {
                Ok(Ok(0)) => return Err(WireError::ConnectionClosed.into()),
                Ok(Ok(n)) => {
                    tracing::trace!("Received {} bytes", n);
                    cache.extend_from_slice(&buf[..n]);
                    let view = Bytes::copy_from_slice(&cache);
                    if let Some(packet) = parse_from_tail(&self.config.packet, &view, view.len()) {
                        return Ok(packet);
                    }
                    tracing::trace!("{} buffered bytes do not form a packet yet", cache.len());
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) if cache.is_empty() => {
                    return Err(WireError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "no reply within timeout",
                    ))
                    .into());
                }
                Err(_) => tracing::trace!("No more reply data available"),
            }

            follow_ups += 1;
            if follow_ups > self.config.receive_attempts {
                return Err(SendFailure::Protocol("reply did not parse as a packet"));
            }
            wait = self.config.receive_poll;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config(remote_addr: SocketAddr) -> ClientConfig {
        ClientConfig {
            remote_addr,
            retry_delay: Duration::from_millis(1),
            reply_timeout: Duration::from_millis(500),
            receive_poll: Duration::from_millis(20),
            ..Default::default()
        }
    }

    /// Accept one connection, read one frame's worth of bytes, answer with
    /// `reply`.
    async fn one_shot_server(reply: Option<Bytes>) -> (SocketAddr, tokio::task::JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 1024];
            let n = stream.read(&mut buf).await.unwrap();
            if let Some(reply) = reply {
                stream.write_all(&reply).await.unwrap();
            }
            // Keep the connection open until the client is done.
            let _ = stream.read(&mut buf).await;
            buf.truncate(n);
            buf
        });
        (addr, task)
    }

    /// Serve one connection per script entry: read a frame, wait, then
    /// answer (or stay silent).
    async fn per_connection_peer(script: Vec<(Duration, Option<Bytes>)>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (delay, reply) in script {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    tokio::time::sleep(delay).await;
                    if let Some(reply) = reply {
                        let _ = stream.write_all(&reply).await;
                    }
                    while matches!(stream.read(&mut buf).await, Ok(n) if n > 0) {}
                });
            }
        });
        addr
    }

    fn response(payload: &'static [u8]) -> Bytes {
        Packet::compose(&PacketConfig::default(), 0x30, 0, payload)
            .unwrap()
            .encode()
    }

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connect_attempts, 10);
        assert_eq!(config.send_attempts, 10);
        assert_eq!(config.retry_delay, Duration::from_millis(10));
        assert!(config.local_addr.is_none());
    }

    #[tokio::test]
    async fn test_fire_and_forget_does_not_read() {
        let (addr, server) = one_shot_server(None).await;
        let client = Client::new(fast_config(addr));

        let result = client
            .send_command(0x05, vec![9, 9], &CancelToken::new())
            .await
            .unwrap();
        assert!(result.sent);
        assert!(result.response.is_empty());

        client.close().await;
        let received = server.await.unwrap();
        let expected = client.create_command(0x05, 0, vec![9, 9]).unwrap().encode();
        assert_eq!(&received[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_ack_accepted() {
        let ack = Packet::ack(&PacketConfig::default()).encode();
        let (addr, _server) = one_shot_server(Some(ack)).await;
        let client = Client::new(fast_config(addr));

        let result = client
            .send_command_with_options(0xAA, 0x01, vec![1, 0, 0, 0], &CancelToken::new())
            .await
            .unwrap();
        assert!(result.sent);
    }

    #[tokio::test]
    async fn test_altered_ack_rejected() {
        let config = PacketConfig::default();
        let not_ack = Packet::compose(&config, 0x01, 0, Bytes::new()).unwrap().encode();
        let (addr, _server) = one_shot_server(Some(not_ack)).await;
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let client = Client::with_events(fast_config(addr), Arc::new(tx));

        let result = client
            .send_command_with_options(0xAA, 0x01, vec![1], &CancelToken::new())
            .await
            .unwrap();
        assert!(!result.sent);

        let mut failed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, crate::events::ClientEvent::PacketFailedToSend(..)) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn test_response_payload_returned() {
        let config = PacketConfig::default();
        let response = Packet::compose(&config, 0x20, 0, &b"pong"[..]).unwrap().encode();
        let (addr, _server) = one_shot_server(Some(response)).await;
        let client = Client::new(fast_config(addr));

        let result = client
            .send_command_with_options(0x20, 0x02, &b"ping"[..], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(result, SendResult::delivered(Bytes::from_static(b"pong")));
    }

    #[tokio::test]
    async fn test_late_reply_not_attributed_to_next_send() {
        let addr = per_connection_peer(vec![
            (Duration::from_millis(400), Some(response(b"reply-to-A"))),
            (Duration::ZERO, Some(response(b"reply-to-B"))),
        ])
        .await;
        let config = ClientConfig {
            reply_timeout: Duration::from_millis(200),
            send_attempts: 1,
            ..fast_config(addr)
        };
        let client = Client::new(config);
        let cancel = CancelToken::new();

        let a = client
            .send_command_with_options(0x30, 0x02, &b"A"[..], &cancel)
            .await
            .unwrap();
        assert!(!a.sent);
        assert!(!client.is_connected().await);

        // Let A's reply land on the abandoned connection.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let b = client
            .send_command_with_options(0x30, 0x02, &b"B"[..], &cancel)
            .await
            .unwrap();
        assert_eq!(b, SendResult::delivered(Bytes::from_static(b"reply-to-B")));
    }

    #[tokio::test]
    async fn test_reply_timeout_retries_on_new_connection() {
        let addr = per_connection_peer(vec![
            (Duration::ZERO, None),
            (Duration::ZERO, Some(Packet::ack(&PacketConfig::default()).encode())),
        ])
        .await;
        let config = ClientConfig {
            reply_timeout: Duration::from_millis(100),
            send_attempts: 2,
            ..fast_config(addr)
        };
        let client = Client::new(config);

        let result = client
            .send_command_with_options(0x01, 0x01, vec![1], &CancelToken::new())
            .await
            .unwrap();
        assert!(result.sent);
        assert!(client.is_connected().await);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_not_sent() {
        // Bind then drop to get a port with nothing listening.
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();
        let config = ClientConfig {
            connect_attempts: 2,
            ..fast_config(addr)
        };
        let client = Client::new(config);

        let result = client
            .send_command(0x01, Bytes::new(), &CancelToken::new())
            .await
            .unwrap();
        assert!(!result.sent);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let client = Client::new(fast_config("127.0.0.1:9".parse().unwrap()));

        let result = client.send_command(0x01, Bytes::new(), &cancel).await.unwrap();
        assert!(!result.sent);
    }

    #[tokio::test]
    async fn test_payload_too_large_is_error() {
        let config = ClientConfig {
            packet: PacketConfig::with_layout(&b"$"[..], &b"#"[..], 1, 4).unwrap(),
            ..Default::default()
        };
        let client = Client::new(config);

        let result = client
            .send_command(0x01, vec![0u8; 5], &CancelToken::new())
            .await;
        assert!(matches!(result, Err(WireError::PayloadTooLarge { .. })));
    }
}
