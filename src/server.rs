//! Server endpoint.
//!
//! [`Server::bind`] opens the listening socket; [`Server::start`] runs the
//! accept loop until [`Server::shutdown`] or the caller's token fires.
//! Every accepted connection gets:
//! - a [`ConnectionId`]
//! - a writer task for acknowledgements and [`Server::send_to`] responses
//! - a read task that forwards raw chunks to the shared reassembler
//!
//! Responses are the consumer's job: observe
//! [`packet_received`](crate::ServerEvents::packet_received) and answer
//! with [`Server::send_to`].
//!
//! Shutdown is scoped to the instance: two servers in one process do not
//! affect each other. [`Server::shutdown`] only stops accepting; open
//! connections are served until the peer leaves or the server is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::RwLock;

use crate::cancel::CancelToken;
use crate::error::{Result, WireError};
use crate::events::{ConnectionId, IdGenerator, NoopEvents, ServerEvents};
use crate::protocol::{Packet, PacketConfig};
use crate::reassembler::{
    spawn_reassembler, ConnectionSink, ReassemblerHandle, ReassemblerStats, DEFAULT_QUEUE_CAPACITY,
};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 100;

/// Default per-connection read buffer size.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Configuration for [`Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. Default: `0.0.0.0:11000`.
    pub addr: SocketAddr,
    /// Framing shared with clients.
    pub packet: PacketConfig,
    pub backlog: u32,
    pub read_buffer_size: usize,
    /// Capacity of the queue between read tasks and the reassembler.
    pub queue_capacity: usize,
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 11000)),
            packet: PacketConfig::default(),
            backlog: DEFAULT_BACKLOG,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            writer: WriterConfig::default(),
        }
    }
}

/// Listening endpoint.
pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    events: Arc<dyn ServerEvents>,
    reassembler: ReassemblerHandle,
    writers: Arc<RwLock<HashMap<ConnectionId, WriterHandle>>>,
    id_gen: IdGenerator,
    active: Arc<AtomicUsize>,
    shutdown: CancelToken,
    closing: CancelToken,
}

impl Server {
    /// Bind without observers. Must be called inside a Tokio runtime.
    pub fn bind(config: ServerConfig) -> Result<Self> {
        Self::bind_with_events(config, Arc::new(NoopEvents))
    }

    /// Bind and report to `events`.
    pub fn bind_with_events(config: ServerConfig, events: Arc<dyn ServerEvents>) -> Result<Self> {
        let socket = if config.addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.addr)?;
        let listener = socket.listen(config.backlog)?;
        let local_addr = listener.local_addr()?;

        let (reassembler, _) = spawn_reassembler(config.packet.clone(), config.queue_capacity);

        tracing::info!("Server listening on {}", local_addr);

        Ok(Self {
            config,
            listener,
            local_addr,
            events,
            reassembler,
            writers: Arc::new(RwLock::new(HashMap::new())),
            id_gen: IdGenerator::new(),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancelToken::new(),
            closing: CancelToken::new(),
        })
    }

    /// Bound address, with the real port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the accept loop.
    ///
    /// Returns once [`shutdown`](Self::shutdown) is called or `cancel`
    /// fires. Either way open connections keep being served.
    pub async fn start(&self, cancel: &CancelToken) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.accept_connection(stream, peer).await,
                    // The peer left before it was accepted; no id exists yet.
                    Err(e) if is_peer_reset(&e) => {
                        tracing::debug!("Peer disconnected during accept: {}", e);
                    }
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        if !self.shutdown.sleep(ACCEPT_ERROR_BACKOFF).await {
                            break;
                        }
                    }
                },
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Server shutting down");
                    break;
                }
                _ = cancel.cancelled() => {
                    tracing::info!("Accept loop cancelled");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Stop the accept loop. Accepted connections are not closed.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Compose a fire-and-forget packet with this server's framing.
    pub fn create_command(&self, command: u8, payload: impl Into<Bytes>) -> Result<Packet> {
        self.create_command_with_options(command, 0x00, payload)
    }

    pub fn create_command_with_options(
        &self,
        command: u8,
        options: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Packet> {
        Packet::compose(&self.config.packet, command, options, payload)
    }

    /// Queue `packet` on connection `id`, waiting for writer capacity.
    ///
    /// # Errors
    ///
    /// [`WireError::ConnectionClosed`] if `id` is not an open connection of
    /// this server.
    pub async fn send_to(&self, id: ConnectionId, packet: &Packet) -> Result<()> {
        let writer = self
            .writers
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(WireError::ConnectionClosed)?;

        tracing::trace!("Queueing command {:#04x} for {}", packet.command(), id);
        writer.send(OutboundFrame::new(packet.encode())).await
    }

    /// Connections currently being read.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.reassembler.stats()
    }

    async fn accept_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
        }

        let id = self.id_gen.next_id();
        tracing::info!("Accepted connection {} from {}", id, peer);
        self.events.connected(id, peer);

        let (reader, writer) = stream.into_split();
        let (writer, _) = spawn_writer_task(writer, self.config.writer.clone());
        let sink = ConnectionSink {
            writer: writer.clone(),
            events: self.events.clone(),
        };

        if self.reassembler.register(id, sink).await.is_err() {
            tracing::warn!("Reassembler stopped, dropping connection {}", id);
            return;
        }
        self.writers.write().await.insert(id, writer);

        self.active.fetch_add(1, Ordering::AcqRel);
        let connection = Connection {
            id,
            reader,
            reassembler: self.reassembler.clone(),
            events: self.events.clone(),
            read_buffer_size: self.config.read_buffer_size,
            closing: self.closing.clone(),
        };
        let active = self.active.clone();
        let writers = self.writers.clone();

        tokio::spawn(async move {
            connection.run().await;
            writers.write().await.remove(&id);
            active.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.closing.cancel();
    }
}

/// Errors meaning the remote end went away, reported as a disconnect.
fn is_peer_reset(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
    )
}

/// Read side of one accepted connection.
struct Connection {
    id: ConnectionId,
    reader: OwnedReadHalf,
    reassembler: ReassemblerHandle,
    events: Arc<dyn ServerEvents>,
    read_buffer_size: usize,
    closing: CancelToken,
}

impl Connection {
    async fn run(mut self) {
        let id = self.id;
        let mut buf = vec![0u8; self.read_buffer_size.max(1)];

        loop {
            let read = tokio::select! {
                read = self.reader.read(&mut buf) => read,
                _ = self.closing.cancelled() => break,
            };

            match read {
                Ok(0) => {
                    tracing::info!("Connection {} closed by peer", id);
                    self.events.disconnected(id);
                    break;
                }
                Ok(n) => {
                    tracing::trace!("Connection {} received {} bytes", id, n);
                    self.events.data_received(id, n);
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if self.reassembler.push(id, chunk).await.is_err() {
                        tracing::warn!("Reassembler stopped, closing connection {}", id);
                        break;
                    }
                }
                Err(e) if is_peer_reset(&e) => {
                    tracing::info!("Connection {} reset by peer", id);
                    self.events.disconnected(id);
                    break;
                }
                Err(e) => {
                    tracing::error!("Read error on connection {}: {}", id, e);
                    self.events.transport_error(id, &e);
                    break;
                }
            }
        }

        let _ = self.reassembler.close(id).await;
    }
}
