//! Dedicated writer task per connection.
//!
//! Replies produced by the reassembler (acknowledgements, unblock replies)
//! and responses queued through `Server::send_to` are handed to a writer
//! task over an mpsc channel instead of locking the socket write half. The
//! task batches whatever is queued into a single vectored write.
//!
//! ```text
//! Reassembler     ─┐
//! Server::send_to ─┴─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► Socket
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, WireError};

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Encoded bytes ready to be written to the socket.
///
/// An empty frame is legal: it is the unblock reply sent after a rejected
/// frame and results in no bytes on the wire.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    pub bytes: Bytes,
}

impl OutboundFrame {
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Self { bytes }
    }

    #[inline]
    pub fn empty() -> Self {
        Self {
            bytes: Bytes::new(),
        }
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Channel capacity for the frame queue.
    pub channel_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// This is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
}

impl WriterHandle {
    /// Queue a frame, waiting for channel capacity.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| WireError::ConnectionClosed)
    }

    /// Queue a frame without waiting.
    ///
    /// A full queue yields an I/O `WouldBlock` error, a stopped task
    /// [`WireError::ConnectionClosed`].
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WireError::Io(std::io::Error::new(
                std::io::ErrorKind::WouldBlock,
                "writer queue full",
            )),
            mpsc::error::TrySendError::Closed(_) => WireError::ConnectionClosed,
        })
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends when every handle is dropped or a write fails; dropping
/// the task drops `writer`, which closes the write side of the socket.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let task = tokio::spawn(writer_loop(rx, writer));

    (WriterHandle { tx }, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(f) => f,
            None => return Ok(()),
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::debug!("Writer task stopping: {}", e);
            return Err(e);
        }
    }
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data not yet written.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len());
    let mut offset = 0;

    for frame in batch {
        let start = offset;
        let end = offset + frame.size();
        if !frame.bytes.is_empty() && skip_bytes < end {
            let start_in_frame = skip_bytes.saturating_sub(start);
            slices.push(IoSlice::new(&frame.bytes[start_in_frame..]));
        }
        offset = end;
    }

    slices
}
