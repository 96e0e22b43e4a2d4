/// File Muxer Module
///
/// Reassembles a file from per-shard byte streams. Inputs arrive as messages
/// on a queue channel, each tagged with the shard index and its declared
/// size; a scheduler task drains them strictly in index order regardless of
/// arrival order, so the output stream is always the in-order concatenation
/// of the shards.
///
/// The muxer completes when the queue closes with every pushed input fully
/// drained. A gap in the index sequence at close, an input delivering the
/// wrong number of bytes, or any input error faults the output stream and
/// halts it; bytes already delivered are never revoked.
use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{MeshError, MeshResult};

/// A boxed stream of shard bytes, as produced by a data channel PULL.
pub type ShardSource = Pin<Box<dyn Stream<Item = MeshResult<Bytes>> + Send>>;

/// Buffered output chunks before the scheduler parks
const OUTPUT_CAPACITY: usize = 16;
/// Buffered queue messages before `push` parks
const QUEUE_CAPACITY: usize = 64;

enum MuxInput {
    Source {
        index: u64,
        size: u64,
        source: ShardSource,
    },
    Fault(MeshError),
}

/// Handle for wiring additional inputs into a running [`FileMuxer`].
///
/// Dropping every clone of the queue signals end-of-pointers; the muxer then
/// completes once everything already pushed has drained.
#[derive(Clone)]
pub struct MuxQueue {
    tx: mpsc::Sender<MuxInput>,
}

impl MuxQueue {
    /// Register the byte source for shard `index`, declaring its exact size.
    pub async fn push(&self, index: u64, size: u64, source: ShardSource) -> MeshResult<()> {
        self.tx
            .send(MuxInput::Source {
                index,
                size,
                source,
            })
            .await
            .map_err(|_| MeshError::Transfer("Muxer is no longer accepting inputs".to_string()))
    }

    /// Fault the output stream without revoking bytes already delivered.
    pub async fn fault(&self, error: MeshError) {
        let _ = self.tx.send(MuxInput::Fault(error)).await;
    }
}

/// Ordered merge of shard streams into one readable byte stream.
pub struct FileMuxer {
    rx: mpsc::Receiver<MeshResult<Bytes>>,
}

impl FileMuxer {
    /// Create an empty muxer and the queue that feeds it.
    pub fn new() -> (FileMuxer, MuxQueue) {
        let (input_tx, input_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CAPACITY);
        tokio::spawn(run_muxer(input_rx, out_tx));
        (FileMuxer { rx: out_rx }, MuxQueue { tx: input_tx })
    }

    /// Drain the whole stream into memory. Test and small-object helper.
    pub async fn read_to_end(mut self) -> MeshResult<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(item) = self.next().await {
            out.extend_from_slice(&item?);
        }
        Ok(out)
    }
}

impl Stream for FileMuxer {
    type Item = MeshResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

async fn run_muxer(mut inputs: mpsc::Receiver<MuxInput>, out: mpsc::Sender<MeshResult<Bytes>>) {
    let mut pending: BTreeMap<u64, (u64, ShardSource)> = BTreeMap::new();
    let mut next: u64 = 0;

    loop {
        // Wait for the input that continues the sequence
        while !pending.contains_key(&next) {
            match inputs.recv().await {
                Some(MuxInput::Source {
                    index,
                    size,
                    source,
                }) => {
                    if index < next || pending.contains_key(&index) {
                        let _ = out
                            .send(Err(MeshError::Transfer(format!(
                                "Duplicate muxer input for shard {}",
                                index
                            ))))
                            .await;
                        return;
                    }
                    pending.insert(index, (size, source));
                }
                Some(MuxInput::Fault(error)) => {
                    let _ = out.send(Err(error)).await;
                    return;
                }
                None => {
                    if pending.is_empty() {
                        debug!(shards = next, "muxer drained all inputs");
                        return;
                    }
                    let _ = out
                        .send(Err(MeshError::Transfer(format!(
                            "Muxer input for shard {} never arrived",
                            next
                        ))))
                        .await;
                    return;
                }
            }
        }

        let (size, mut source) = pending.remove(&next).expect("input present");
        let mut delivered: u64 = 0;
        while let Some(item) = source.next().await {
            match item {
                Ok(chunk) => {
                    delivered += chunk.len() as u64;
                    if out.send(Ok(chunk)).await.is_err() {
                        // Consumer hung up; stop pulling from peers
                        return;
                    }
                }
                Err(error) => {
                    let _ = out.send(Err(error)).await;
                    return;
                }
            }
        }
        if delivered != size {
            let _ = out
                .send(Err(MeshError::Transfer(format!(
                    "Shard {} delivered {} bytes, expected {}",
                    next, delivered, size
                ))))
                .await;
            return;
        }
        next += 1;
    }
}

/// Wrap an in-memory byte vector as a [`ShardSource`]. Chunking is preserved
/// as given.
pub fn source_from_chunks(chunks: Vec<MeshResult<Bytes>>) -> ShardSource {
    Box::pin(futures::stream::iter(chunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes_source(data: &[u8]) -> ShardSource {
        source_from_chunks(vec![Ok(Bytes::copy_from_slice(data))])
    }

    #[tokio::test]
    async fn test_out_of_order_arrival_yields_in_order_bytes() {
        let (muxer, queue) = FileMuxer::new();
        queue.push(2, 3, bytes_source(b"two")).await.unwrap();
        queue.push(0, 4, bytes_source(b"zero")).await.unwrap();
        queue.push(1, 3, bytes_source(b"one")).await.unwrap();
        drop(queue);

        assert_eq!(muxer.read_to_end().await.unwrap(), b"zeroonetwo");
    }

    #[tokio::test]
    async fn test_input_error_faults_output() {
        let (muxer, queue) = FileMuxer::new();
        queue.push(0, 4, bytes_source(b"good")).await.unwrap();
        queue
            .push(
                1,
                4,
                source_from_chunks(vec![Err(MeshError::Transfer("Failed".into()))]),
            )
            .await
            .unwrap();
        drop(queue);

        let err = muxer.read_to_end().await.unwrap_err();
        assert!(err.to_string().contains("Failed"));
    }

    #[tokio::test]
    async fn test_gap_at_close_is_an_error() {
        let (muxer, queue) = FileMuxer::new();
        queue.push(0, 1, bytes_source(b"a")).await.unwrap();
        queue.push(2, 1, bytes_source(b"c")).await.unwrap();
        drop(queue);

        let err = muxer.read_to_end().await.unwrap_err();
        assert!(err.to_string().contains("shard 1"));
    }

    #[tokio::test]
    async fn test_size_mismatch_is_an_error() {
        let (muxer, queue) = FileMuxer::new();
        queue.push(0, 10, bytes_source(b"short")).await.unwrap();
        drop(queue);

        let err = muxer.read_to_end().await.unwrap_err();
        assert!(err.to_string().contains("expected 10"));
    }

    #[tokio::test]
    async fn test_inputs_pushed_while_draining() {
        let (muxer, queue) = FileMuxer::new();
        queue.push(0, 5, bytes_source(b"first")).await.unwrap();
        let feeder = tokio::spawn(async move {
            queue.push(1, 6, bytes_source(b"second")).await.unwrap();
            drop(queue);
        });

        assert_eq!(muxer.read_to_end().await.unwrap(), b"firstsecond");
        feeder.await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_queue_completes_empty() {
        let (muxer, queue) = FileMuxer::new();
        drop(queue);
        assert!(muxer.read_to_end().await.unwrap().is_empty());
    }
}
