//! Packet reassembly across connections.
//!
//! Socket read tasks push raw chunks into one bounded queue; a single
//! consumer task drains it and drives a [`FrameBuffer`] per connection.
//! Only the consumer touches assembly state, so no per-connection locks
//! are needed, and a full queue backpressures the readers.
//!
//! ```text
//! read task 1 ─┐                                   ┌─► ServerEvents::packet_received
//! read task 2 ─┼─► mpsc (bounded) ─► consumer task ─┤
//! read task N ─┘                                   └─► WriterHandle (ACK / unblock)
//! ```
//!
//! Per connection the queue preserves receive order. Across connections
//! there is no ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, WireError};
use crate::events::{ConnectionId, ServerEvents};
use crate::protocol::{parse_fixed, Assembled, FrameBuffer, Packet, PacketConfig};
use crate::writer::{OutboundFrame, WriterHandle};

/// Default capacity of the shared inbound queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Where completed packets of one connection are reported and replied to.
#[derive(Clone)]
pub struct ConnectionSink {
    pub writer: WriterHandle,
    pub events: Arc<dyn ServerEvents>,
}

enum Inbound {
    Opened { id: ConnectionId, sink: ConnectionSink },
    Data { id: ConnectionId, bytes: Bytes },
    Closed { id: ConnectionId },
}

/// Snapshot of reassembly counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblerStats {
    /// Frames parsed and reported.
    pub frames_completed: u64,
    /// Frames that failed validation or announced an oversized payload.
    pub frames_rejected: u64,
    /// Frames completed on a connection with no registered sink.
    pub frames_dropped: u64,
    /// Raw bytes consumed by the state machines.
    pub bytes_consumed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    frames_completed: AtomicU64,
    frames_rejected: AtomicU64,
    frames_dropped: AtomicU64,
    bytes_consumed: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ReassemblerStats {
        ReassemblerStats {
            frames_completed: self.frames_completed.load(Ordering::Relaxed),
            frames_rejected: self.frames_rejected.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_consumed: self.bytes_consumed.load(Ordering::Relaxed),
        }
    }
}

/// Producer side of the reassembly queue. Cheap to clone.
///
/// The consumer task stops once every handle is dropped.
#[derive(Clone)]
pub struct ReassemblerHandle {
    tx: mpsc::Sender<Inbound>,
    counters: Arc<Counters>,
}

impl ReassemblerHandle {
    /// Register the sink for a connection. Must precede its data.
    pub async fn register(&self, id: ConnectionId, sink: ConnectionSink) -> Result<()> {
        self.enqueue(Inbound::Opened { id, sink }).await
    }

    /// Queue a chunk read from `id`, waiting while the queue is full.
    pub async fn push(&self, id: ConnectionId, bytes: Bytes) -> Result<()> {
        self.enqueue(Inbound::Data { id, bytes }).await
    }

    /// Drop all state kept for `id`.
    pub async fn close(&self, id: ConnectionId) -> Result<()> {
        self.enqueue(Inbound::Closed { id }).await
    }

    pub fn stats(&self) -> ReassemblerStats {
        self.counters.snapshot()
    }

    async fn enqueue(&self, item: Inbound) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| WireError::ConnectionClosed)
    }
}

/// Spawn the consumer task.
pub fn spawn_reassembler(
    config: PacketConfig,
    capacity: usize,
) -> (ReassemblerHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(Counters::default());

    let consumer = Consumer {
        ack: OutboundFrame::new(Packet::ack(&config).encode()),
        config,
        buffers: HashMap::new(),
        sinks: HashMap::new(),
        counters: counters.clone(),
    };
    let task = tokio::spawn(consumer.run(rx));

    (ReassemblerHandle { tx, counters }, task)
}

struct Consumer {
    config: PacketConfig,
    ack: OutboundFrame,
    buffers: HashMap<ConnectionId, FrameBuffer>,
    sinks: HashMap<ConnectionId, ConnectionSink>,
    counters: Arc<Counters>,
}

impl Consumer {
    async fn run(mut self, mut rx: mpsc::Receiver<Inbound>) {
        while let Some(item) = rx.recv().await {
            match item {
                Inbound::Opened { id, sink } => {
                    self.sinks.insert(id, sink);
                }
                Inbound::Data { id, bytes } => self.consume(id, &bytes),
                Inbound::Closed { id } => {
                    self.buffers.remove(&id);
                    self.sinks.remove(&id);
                    tracing::trace!("Released reassembly state for {}", id);
                }
            }
        }
        tracing::debug!("Reassembler queue closed");
    }

    fn consume(&mut self, id: ConnectionId, bytes: &[u8]) {
        self.counters
            .bytes_consumed
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let config = &self.config;
        let buffer = self
            .buffers
            .entry(id)
            .or_insert_with(|| FrameBuffer::new(config));
        let assembled = buffer.push(bytes);

        for item in assembled {
            match item {
                Assembled::Complete(frame) => self.complete(id, frame),
                Assembled::Oversized { declared } => {
                    self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "{} announced a {} byte payload, above maximum {}",
                        id,
                        declared,
                        self.config.max_payload_size()
                    );
                    if let Some(sink) = self.sinks.get(&id) {
                        reply(id, &sink.writer, OutboundFrame::empty());
                    }
                }
            }
        }
    }

    fn complete(&self, id: ConnectionId, frame: Bytes) {
        let Some(sink) = self.sinks.get(&id) else {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("No sink registered for {}, dropping {} byte frame", id, frame.len());
            return;
        };

        match parse_fixed(&self.config, &frame) {
            Some(packet) => {
                self.counters.frames_completed.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("{} completed packet, command {:#04x}", id, packet.command());

                sink.events.packet_received(id, &packet);

                if packet.options().wants_ack_only() {
                    reply(id, &sink.writer, self.ack.clone());
                }
            }
            None => {
                self.counters.frames_rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("{} sent {} bytes that do not parse as a packet", id, frame.len());
                reply(id, &sink.writer, OutboundFrame::empty());
            }
        }
    }
}

/// Replies never block the consumer; a stalled peer loses its reply.
fn reply(id: ConnectionId, writer: &WriterHandle, frame: OutboundFrame) {
    if let Err(e) = writer.try_send(frame) {
        tracing::warn!("Failed to queue reply for {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ServerEvent;
    use crate::protocol::CommandOptions;
    use crate::writer::{spawn_writer_task, WriterConfig};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Harness {
        handle: ReassemblerHandle,
        events: mpsc::UnboundedReceiver<ServerEvent>,
        events_tx: mpsc::UnboundedSender<ServerEvent>,
        config: PacketConfig,
    }

    impl Harness {
        fn new() -> Self {
            let config = PacketConfig::default();
            let (handle, _task) = spawn_reassembler(config.clone(), 16);
            let (events_tx, events) = mpsc::unbounded_channel();
            Self {
                handle,
                events,
                events_tx,
                config,
            }
        }

        /// Register `id` and return the peer side of its reply stream.
        async fn open(&self, id: ConnectionId) -> DuplexStream {
            let (local, remote) = duplex(4096);
            let (writer, _task) = spawn_writer_task(local, WriterConfig::default());
            let sink = ConnectionSink {
                writer,
                events: Arc::new(self.events_tx.clone()),
            };
            self.handle.register(id, sink).await.unwrap();
            remote
        }

        fn frame(&self, command: u8, options: u8, payload: &[u8]) -> Bytes {
            Packet::compose(&self.config, command, options, Bytes::copy_from_slice(payload))
                .unwrap()
                .encode()
        }

        async fn next_packet(&mut self) -> (ConnectionId, Packet) {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                    .await
                    .expect("timed out waiting for packet")
                    .expect("event channel closed");
                if let ServerEvent::PacketReceived(id, packet) = event {
                    return (id, packet);
                }
            }
        }

        /// Wait until everything queued so far has been consumed.
        async fn barrier(&mut self) {
            let id = ConnectionId(u64::MAX);
            let _peer = self.open(id).await;
            let frame = self.frame(0xFF, 0, b"barrier");
            self.handle.push(id, frame).await.unwrap();
            let (got, _) = self.next_packet().await;
            assert_eq!(got, id);
        }
    }

    #[tokio::test]
    async fn test_whole_frame() {
        let mut h = Harness::new();
        let id = ConnectionId(1);
        let _peer = h.open(id).await;

        h.handle.push(id, h.frame(0xAA, 0, &[1, 0, 0, 0])).await.unwrap();

        let (got, packet) = h.next_packet().await;
        assert_eq!(got, id);
        assert_eq!(packet.command(), 0xAA);
        assert_eq!(packet.payload(), &[1, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_byte_at_a_time_matches_whole() {
        let mut h = Harness::new();
        let id = ConnectionId(1);
        let _peer = h.open(id).await;
        let frame = h.frame(0x10, 0, b"split me");

        for i in 0..frame.len() {
            h.handle.push(id, frame.slice(i..i + 1)).await.unwrap();
        }
        let (_, split) = h.next_packet().await;

        h.handle.push(id, frame.clone()).await.unwrap();
        let (_, whole) = h.next_packet().await;

        assert_eq!(split, whole);
        h.barrier().await;
        assert_eq!(h.handle.stats().frames_completed, 3);
    }

    #[tokio::test]
    async fn test_interleaved_connections() {
        let mut h = Harness::new();
        let a = ConnectionId(1);
        let b = ConnectionId(2);
        let _pa = h.open(a).await;
        let _pb = h.open(b).await;

        let frame_a = h.frame(0x0A, 0, b"from a, a bit longer");
        let frame_b = h.frame(0x0B, 0, b"from b");

        let chunks_a: Vec<_> = frame_a.chunks(3).map(Bytes::copy_from_slice).collect();
        let chunks_b: Vec<_> = frame_b.chunks(2).map(Bytes::copy_from_slice).collect();
        let rounds = chunks_a.len().max(chunks_b.len());
        for i in 0..rounds {
            if let Some(chunk) = chunks_a.get(i) {
                h.handle.push(a, chunk.clone()).await.unwrap();
            }
            if let Some(chunk) = chunks_b.get(i) {
                h.handle.push(b, chunk.clone()).await.unwrap();
            }
        }

        let mut received = vec![h.next_packet().await, h.next_packet().await];
        received.sort_by_key(|(id, _)| *id);

        assert_eq!(received[0].0, a);
        assert_eq!(received[0].1.command(), 0x0A);
        assert_eq!(received[1].0, b);
        assert_eq!(received[1].1.payload(), b"from b");
    }

    #[tokio::test]
    async fn test_ack_written_back() {
        let mut h = Harness::new();
        let id = ConnectionId(1);
        let mut peer = h.open(id).await;

        let options = CommandOptions::new().ack_required(true).build();
        h.handle.push(id, h.frame(0x01, options, b"x")).await.unwrap();
        h.next_packet().await;

        let ack = Packet::ack(&h.config).encode();
        let mut buf = vec![0u8; ack.len()];
        tokio::time::timeout(Duration::from_secs(2), peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..], &ack[..]);
    }

    #[tokio::test]
    async fn test_no_ack_when_response_required() {
        let mut h = Harness::new();
        let id = ConnectionId(1);
        let mut peer = h.open(id).await;

        let options = CommandOptions::new()
            .ack_required(true)
            .response_required(true)
            .build();
        h.handle.push(id, h.frame(0x01, options, b"x")).await.unwrap();
        h.next_packet().await;
        h.barrier().await;

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(Duration::from_millis(50), peer.read(&mut buf)).await;
        assert!(read.is_err(), "no reply expected");
    }

    #[tokio::test]
    async fn test_rejected_frame_not_reported() {
        let mut h = Harness::new();
        let id = ConnectionId(1);
        let _peer = h.open(id).await;

        let mut corrupted = h.frame(0x01, 0, b"abc").to_vec();
        let crc = corrupted.len() - 3;
        corrupted[crc] ^= 0x55;
        h.handle.push(id, Bytes::from(corrupted)).await.unwrap();

        // The state machine resynchronises on the next frame boundary.
        h.handle.push(id, h.frame(0x02, 0, b"ok")).await.unwrap();
        let (_, packet) = h.next_packet().await;
        assert_eq!(packet.command(), 0x02);
        assert_eq!(h.handle.stats().frames_rejected, 1);
    }

    #[tokio::test]
    async fn test_unregistered_connection_dropped() {
        let mut h = Harness::new();
        let id = ConnectionId(7);

        h.handle.push(id, h.frame(0x01, 0, b"lost")).await.unwrap();
        h.barrier().await;

        let stats = h.handle.stats();
        assert_eq!(stats.frames_dropped, 1);
        assert_eq!(stats.frames_completed, 1);
    }

    #[tokio::test]
    async fn test_close_discards_partial_state() {
        let mut h = Harness::new();
        let id = ConnectionId(3);
        let _peer = h.open(id).await;
        let frame = h.frame(0x03, 0, b"payload");

        h.handle.push(id, frame.slice(..6)).await.unwrap();
        h.handle.close(id).await.unwrap();

        let _peer = h.open(id).await;
        h.handle.push(id, frame.clone()).await.unwrap();

        let (_, packet) = h.next_packet().await;
        assert_eq!(packet.payload(), b"payload");
    }

    #[tokio::test]
    async fn test_consumer_stops_when_handles_dropped() {
        let (handle, task) = spawn_reassembler(PacketConfig::default(), 4);
        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
