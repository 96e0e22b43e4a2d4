/// Download Orchestrator Module
///
/// Turns a bucket file entry back into a byte stream: acquires a PULL token,
/// resolves pointer pages into data-channel streams, and feeds them into the
/// muxer's input queue in index order. Pages after the first are fetched
/// asynchronously while earlier inputs drain; an empty page closes the queue
/// and lets the muxer complete.
///
/// A pointer whose channel fails before delivering a byte is re-resolved
/// once: the farmer joins the exclude set and the single slice is requested
/// again. Failures past that point fault the readable without revoking bytes
/// already delivered.
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::BridgeClient;
use crate::channel::ChannelFactory;
use crate::error::{MeshError, MeshResult};
use crate::logging;
use crate::models::{Operation, Pointer};
use crate::mux::{FileMuxer, MuxQueue, ShardSource};

/// Per-download knobs.
#[derive(Clone)]
pub struct DownloadOptions {
    /// Pointer offset to start from
    pub skip: u64,
    /// Pointers per page
    pub limit: u64,
    /// nodeIDs never to pull from
    pub exclude: Vec<String>,
    /// Cancelling this token closes the muxer and pending channels
    pub cancel: CancellationToken,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: 6,
            exclude: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Download pipeline front end.
pub struct Downloader {
    bridge: Arc<BridgeClient>,
    channels: Arc<dyn ChannelFactory>,
}

impl Downloader {
    pub fn new(bridge: Arc<BridgeClient>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self { bridge, channels }
    }

    /// Open a readable stream over a stored file.
    ///
    /// Returns once the first pointer page is wired into the muxer; later
    /// pages are fetched and wired in the background until one comes back
    /// empty. A later-page failure faults the stream in place.
    pub async fn create_file_stream(
        &self,
        bucket_id: &str,
        file_id: &str,
        options: DownloadOptions,
    ) -> MeshResult<FileMuxer> {
        let token = self
            .bridge
            .create_token(bucket_id, Operation::Pull)
            .await?;
        let first_page = self
            .bridge
            .get_file_pointers(
                bucket_id,
                file_id,
                &token.token,
                options.skip,
                options.limit,
                &options.exclude,
            )
            .await?;
        info!(
            bucket = bucket_id,
            file = file_id,
            pointers = first_page.len(),
            "first pointer page resolved"
        );

        let (muxer, queue) = self.resolve_file_from_pointers(&first_page).await?;
        if first_page.is_empty() {
            // Zero-shard file: nothing further to fetch
            return Ok(muxer);
        }

        let loop_state = PageLoop {
            bridge: self.bridge.clone(),
            channels: self.channels.clone(),
            bucket_id: bucket_id.to_string(),
            file_id: file_id.to_string(),
            token: token.token,
            limit: options.limit,
            exclude: options.exclude,
            cancel: options.cancel,
        };
        let skip = options.skip + first_page.len() as u64;
        tokio::spawn(loop_state.run(skip, queue));
        Ok(muxer)
    }

    /// Wire a set of pointers into a fresh muxer.
    ///
    /// Channels open concurrently under the transfer concurrency cap; the
    /// call returns once every pointer of this batch is attached. Channel
    /// errors propagate to the returned readable rather than failing the
    /// call. The queue accepts further inputs; dropping it completes the
    /// stream after the wired inputs drain.
    pub async fn resolve_file_from_pointers(
        &self,
        pointers: &[Pointer],
    ) -> MeshResult<(FileMuxer, MuxQueue)> {
        let (muxer, queue) = FileMuxer::new();
        let concurrency = self.bridge.options().transfer.concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut wiring: JoinSet<()> = JoinSet::new();

        for pointer in pointers.iter().cloned() {
            let channels = self.channels.clone();
            let queue = queue.clone();
            let semaphore = semaphore.clone();
            wiring.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                match open_slice(&*channels, &pointer).await {
                    Ok(source) => {
                        let _ = queue.push(pointer.index, pointer.size, source).await;
                    }
                    Err(error) => queue.fault(error).await,
                }
            });
        }
        while wiring.join_next().await.is_some() {}

        Ok((muxer, queue))
    }
}

async fn open_slice(channels: &dyn ChannelFactory, pointer: &Pointer) -> MeshResult<ShardSource> {
    let channel = channels.open(&pointer.farmer).await?;
    channel.pull(&pointer.token, &pointer.hash).await
}

/// Background fetcher for pointer pages beyond the first.
struct PageLoop {
    bridge: Arc<BridgeClient>,
    channels: Arc<dyn ChannelFactory>,
    bucket_id: String,
    file_id: String,
    token: String,
    limit: u64,
    exclude: Vec<String>,
    cancel: CancellationToken,
}

impl PageLoop {
    async fn run(mut self, mut skip: u64, queue: MuxQueue) {
        loop {
            if self.cancel.is_cancelled() {
                queue
                    .fault(MeshError::Fatal("Download was aborted".to_string()))
                    .await;
                return;
            }

            let page = self
                .bridge
                .get_file_pointers(
                    &self.bucket_id,
                    &self.file_id,
                    &self.token,
                    skip,
                    self.limit,
                    &self.exclude,
                )
                .await;
            let page = match page {
                Ok(page) => page,
                Err(error) => {
                    // Bytes already delivered stay delivered; the stream
                    // faults at the current position
                    logging::log_error_with_context("pointer page fetch failed", &error);
                    queue.fault(error).await;
                    return;
                }
            };
            if page.is_empty() {
                debug!(skip, "pointer pages exhausted");
                // Dropping the queue signals end-of-pointers
                return;
            }

            skip += page.len() as u64;
            for pointer in page {
                if self.cancel.is_cancelled() {
                    queue
                        .fault(MeshError::Fatal("Download was aborted".to_string()))
                        .await;
                    return;
                }
                match self.wire_slice(pointer).await {
                    Ok((index, size, source)) => {
                        if queue.push(index, size, source).await.is_err() {
                            // Consumer is gone
                            return;
                        }
                    }
                    Err(error) => {
                        queue.fault(error).await;
                        return;
                    }
                }
            }
        }
    }

    /// Open a slice, re-resolving once through the bridge if the assigned
    /// farmer cannot be reached.
    async fn wire_slice(&mut self, pointer: Pointer) -> MeshResult<(u64, u64, ShardSource)> {
        let index = pointer.index;
        let size = pointer.size;
        match open_slice(&*self.channels, &pointer).await {
            Ok(source) => Ok((index, size, source)),
            Err(error) => {
                logging::log_transfer_event(
                    "re-resolving slice",
                    index,
                    &format!("farmer {} unreachable: {}", pointer.farmer.node_id, error),
                );
                self.exclude.push(pointer.farmer.node_id.clone());
                let replacements = self
                    .bridge
                    .get_file_pointers(
                        &self.bucket_id,
                        &self.file_id,
                        &self.token,
                        index,
                        1,
                        &self.exclude,
                    )
                    .await?;
                let replacement = replacements.into_iter().next().ok_or_else(|| {
                    MeshError::Fatal(format!("No farmers remain for shard {}", index))
                })?;
                let source = open_slice(&*self.channels, &replacement).await?;
                Ok((replacement.index, replacement.size, source))
            }
        }
    }
}
