/// File Demuxer Module
///
/// Splits a byte source into fixed-size shard substreams. A spawned reader
/// task walks the source in 64 KiB chunks and emits one [`DemuxEvent::Shard`]
/// per shard; each shard carries its own bounded channel of byte chunks, and
/// shard N's channel is closed before shard N+1's event is sent. Bounded
/// channels give natural backpressure: while the consumer is not reading,
/// the reader task is parked and the source is not advanced.
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{MeshError, MeshResult};

/// Read granularity; also bounds how long hashing may run between yields.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Buffered chunks per shard substream before the reader parks
const SHARD_CHANNEL_CAPACITY: usize = 4;

/// Events produced by the demuxer, in order: zero or more `Shard`s, then
/// exactly one of `Finished` or `Faulted`.
pub enum DemuxEvent {
    /// A shard substream. Chunks total exactly `shard_size` bytes, except
    /// possibly for the final shard.
    Shard {
        index: u64,
        data: mpsc::Receiver<MeshResult<Bytes>>,
    },
    /// The source is exhausted; `shards` substreams were emitted.
    Finished { shards: u64 },
    /// The source failed before the first shard was emitted.
    Faulted(MeshError),
}

/// Demultiplex `source` into shards of `shard_size` bytes.
///
/// Returns the event stream; the reader task ends when the source does or
/// when the consumer drops the receiver.
pub fn demux<R>(source: R, shard_size: u64) -> mpsc::Receiver<DemuxEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    assert!(shard_size > 0, "shard size must be positive");
    let (event_tx, event_rx) = mpsc::channel(1);
    tokio::spawn(run_demuxer(source, shard_size, event_tx));
    event_rx
}

async fn run_demuxer<R>(mut source: R, shard_size: u64, events: mpsc::Sender<DemuxEvent>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut index: u64 = 0;
    let mut shard_tx: Option<mpsc::Sender<MeshResult<Bytes>>> = None;
    let mut shard_remaining: u64 = 0;
    let mut buffer = BytesMut::with_capacity(CHUNK_SIZE);

    loop {
        buffer.clear();
        buffer.reserve(CHUNK_SIZE);
        match source.read_buf(&mut buffer).await {
            Ok(0) => {
                drop(shard_tx);
                debug!(shards = index, "demuxer finished");
                let _ = events.send(DemuxEvent::Finished { shards: index }).await;
                return;
            }
            Ok(_) => {
                let mut chunk = buffer.split().freeze();
                while !chunk.is_empty() {
                    if shard_tx.is_none() {
                        let (tx, rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
                        if events
                            .send(DemuxEvent::Shard { index, data: rx })
                            .await
                            .is_err()
                        {
                            // Consumer is gone; stop reading the source
                            return;
                        }
                        shard_tx = Some(tx);
                        shard_remaining = shard_size;
                        index += 1;
                    }

                    let take = (shard_remaining as usize).min(chunk.len());
                    let piece = chunk.split_to(take);
                    shard_remaining -= take as u64;
                    let tx = shard_tx.as_ref().expect("shard channel open");
                    if tx.send(Ok(piece)).await.is_err() {
                        return;
                    }
                    if shard_remaining == 0 {
                        shard_tx = None;
                    }
                }
            }
            Err(e) => {
                let error = MeshError::Demux(format!("Source read failed: {}", e));
                match shard_tx.take() {
                    // Mid-shard failure surfaces on the shard stream
                    Some(tx) => {
                        let _ = tx.send(Err(error)).await;
                    }
                    None => {
                        let _ = events.send(DemuxEvent::Faulted(error)).await;
                    }
                }
                return;
            }
        }
    }
}
