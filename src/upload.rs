/// Upload Orchestrator Module
///
/// Drives a complete file upload: shard sizing, staging-frame creation,
/// demuxing the source into hashed temp files, per-shard contract
/// negotiation, and concurrent shard transfers over data channels with the
/// retry/reassign state machine.
///
/// One task runs per shard, gated by a semaphore with a fixed worker count.
/// Shards may complete in any order; only the final file-entry POST requires
/// all of them. The first fatal error cancels every outstanding task, deletes
/// all temp files, and is the single error surfaced to the caller.
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::BridgeClient;
use crate::channel::ChannelFactory;
use crate::config::TransferConfig;
use crate::demux::{demux, DemuxEvent};
use crate::error::{MeshError, MeshResult};
use crate::logging;
use crate::models::{FileEntry, ShardMeta};
use crate::shard::{determine_shard_size, FinalizedShard, ShardHasher};

/// Per-upload knobs beyond the client configuration.
#[derive(Clone)]
pub struct StoreOptions {
    /// Entry filename; defaults to the source file's name
    pub filename: Option<String>,
    /// Entry mimetype
    pub mimetype: String,
    /// Cancelling this token aborts the upload, killing the worker queue and
    /// removing temp files
    pub cancel: CancellationToken,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            filename: None,
            mimetype: "application/octet-stream".to_string(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Outcome of one data-channel attempt, driving the per-shard state machine.
enum TransferOutcome {
    Finished,
    RetrySame(MeshError),
    RetryOther(MeshError),
    Fatal(MeshError),
}

/// Upload pipeline front end.
pub struct Uploader {
    bridge: Arc<BridgeClient>,
    channels: Arc<dyn ChannelFactory>,
}

/// Temp files currently on disk for an in-flight upload.
type TempRegistry = Arc<Mutex<HashSet<PathBuf>>>;

impl Uploader {
    pub fn new(bridge: Arc<BridgeClient>, channels: Arc<dyn ChannelFactory>) -> Self {
        Self { bridge, channels }
    }

    /// Store a local file in a bucket.
    ///
    /// `token` is the PUSH capability for the bucket; it authorizes the final
    /// file-entry POST. Shard transfers use the per-contract tokens returned
    /// during negotiation.
    pub async fn store_file_in_bucket(
        &self,
        bucket_id: &str,
        token: &str,
        path: &Path,
        options: StoreOptions,
    ) -> MeshResult<FileEntry> {
        let config = self.bridge.options().transfer.clone();
        let registry: TempRegistry = Arc::new(Mutex::new(HashSet::new()));

        let result = self
            .run_upload(bucket_id, token, path, &options, &config, &registry)
            .await;
        if let Err(error) = &result {
            logging::log_error_with_context("upload failed", error);
            options.cancel.cancel();
            remove_temp_files(&registry).await;
        }
        result
    }

    async fn run_upload(
        &self,
        bucket_id: &str,
        token: &str,
        path: &Path,
        options: &StoreOptions,
        config: &TransferConfig,
        registry: &TempRegistry,
    ) -> MeshResult<FileEntry> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| MeshError::Fatal(format!("Could not stat source file: {}", e)))?;
        let file_size = metadata.len();
        let shard_size = config
            .shard_size
            .unwrap_or_else(|| determine_shard_size(file_size, config.max_shards_per_file));
        let filename = options
            .filename
            .clone()
            .or_else(|| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| "untitled".to_string());

        let frame = self
            .bridge
            .create_file_staging_frame()
            .await
            .map_err(|e| MeshError::Fatal(format!("Could not create staging frame: {}", e)))?;
        info!(
            frame = %frame.id,
            file_size,
            shard_size,
            "staging frame created, demuxing source"
        );

        let source = tokio::fs::File::open(path).await?;
        let mut events = demux(source, shard_size);
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let mut tasks: JoinSet<MeshResult<u64>> = JoinSet::new();
        let mut spawned: u64 = 0;
        let mut completed: u64 = 0;

        let total_shards = loop {
            if options.cancel.is_cancelled() {
                abort_tasks(&mut tasks).await;
                return Err(MeshError::Fatal("Upload was aborted".to_string()));
            }
            // Surface transfer failures early instead of demuxing to the end
            while let Some(result) = tasks.try_join_next() {
                match flatten(result) {
                    Ok(_) => completed += 1,
                    Err(error) => {
                        abort_tasks(&mut tasks).await;
                        return Err(error);
                    }
                }
            }

            match events.recv().await {
                Some(DemuxEvent::Shard { index, data }) => {
                    let finalized =
                        drain_shard_to_temp(index, data, config, registry).await?;
                    spawned += 1;
                    let task = ShardTask {
                        bridge: self.bridge.clone(),
                        channels: self.channels.clone(),
                        frame_id: frame.id.clone(),
                        config: config.clone(),
                        registry: registry.clone(),
                        cancel: options.cancel.clone(),
                        semaphore: semaphore.clone(),
                    };
                    tasks.spawn(async move { task.transfer(finalized).await });
                }
                Some(DemuxEvent::Finished { shards }) => break shards,
                Some(DemuxEvent::Faulted(error)) => {
                    abort_tasks(&mut tasks).await;
                    return Err(error);
                }
                None => {
                    abort_tasks(&mut tasks).await;
                    return Err(MeshError::Demux(
                        "Demuxer ended without a completion event".to_string(),
                    ));
                }
            }
        };
        debug!(total_shards, spawned, "demux complete, awaiting transfers");

        while let Some(result) = tasks.join_next().await {
            match flatten(result) {
                Ok(index) => {
                    completed += 1;
                    debug!(shard = index, completed, total_shards, "shard transferred");
                }
                Err(error) => {
                    abort_tasks(&mut tasks).await;
                    return Err(error);
                }
            }
        }
        if completed != total_shards {
            return Err(MeshError::Fatal(format!(
                "Only {} of {} shards completed",
                completed, total_shards
            )));
        }

        let entry = self
            .bridge
            .create_entry_from_frame(bucket_id, &frame.id, &options.mimetype, &filename, token)
            .await?;
        info!(frame = %frame.id, filename = %entry.filename, "file entry created");
        Ok(entry)
    }
}

/// Per-shard transfer context handed to the worker task.
struct ShardTask {
    bridge: Arc<BridgeClient>,
    channels: Arc<dyn ChannelFactory>,
    frame_id: String,
    config: TransferConfig,
    registry: TempRegistry,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
}

impl ShardTask {
    /// Negotiate a contract and move the shard, excluding farmers that
    /// exhaust their retry allowance until none remain.
    async fn transfer(&self, shard: TempShard) -> MeshResult<u64> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| MeshError::Fatal("Upload worker queue was killed".to_string()))?;

        let mut exclude: Vec<String> = Vec::new();
        loop {
            if self.cancel.is_cancelled() {
                return Err(MeshError::Fatal("Upload was aborted".to_string()));
            }

            let meta = ShardMeta {
                index: shard.index,
                hash: shard.hash.clone(),
                size: shard.size,
                tree: shard.tree_leaves.clone(),
                challenges: shard.challenges.clone(),
                exclude: exclude.clone(),
            };
            let allocation = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(MeshError::Fatal("Upload was aborted".to_string()));
                }
                result = self.bridge.add_shard_to_file_staging_frame(
                    &self.frame_id,
                    &meta,
                    self.config.add_shard_retries,
                ) => result?,
            };
            if exclude.contains(&allocation.farmer.node_id) {
                return Err(MeshError::Fatal(format!(
                    "No farmers remain for shard {}",
                    shard.index
                )));
            }

            for attempt in 1..=self.config.transfer_retries.max(1) {
                let push = async {
                    let channel = self.channels.open(&allocation.farmer).await?;
                    channel
                        .push(&allocation.token, &shard.hash, &shard.tmp_path)
                        .await
                };
                let outcome = tokio::select! {
                    _ = self.cancel.cancelled() => TransferOutcome::Fatal(
                        MeshError::Fatal("Upload was aborted".to_string()),
                    ),
                    result = push => match result {
                        Ok(()) => TransferOutcome::Finished,
                        // Temp file trouble cannot be fixed by another farmer
                        Err(error @ MeshError::Io(_)) => TransferOutcome::Fatal(error),
                        Err(error) if attempt < self.config.transfer_retries.max(1) => {
                            TransferOutcome::RetrySame(error)
                        }
                        Err(error) => TransferOutcome::RetryOther(error),
                    },
                };

                match outcome {
                    TransferOutcome::Finished => {
                        self.registry.lock().unwrap().remove(&shard.tmp_path);
                        let _ = tokio::fs::remove_file(&shard.tmp_path).await;
                        return Ok(shard.index);
                    }
                    TransferOutcome::RetrySame(error) => {
                        logging::log_transfer_event(
                            "retrying transfer",
                            shard.index,
                            &format!(
                                "farmer {} attempt {}: {}",
                                allocation.farmer.node_id, attempt, error
                            ),
                        );
                    }
                    TransferOutcome::RetryOther(error) => {
                        logging::log_transfer_event(
                            "renegotiating contract",
                            shard.index,
                            &format!(
                                "farmer {} exhausted its retries: {}",
                                allocation.farmer.node_id, error
                            ),
                        );
                        exclude.push(allocation.farmer.node_id.clone());
                    }
                    TransferOutcome::Fatal(error) => return Err(error),
                }
            }
        }
    }
}

/// A shard persisted to its temp file with all digests computed.
struct TempShard {
    index: u64,
    size: u64,
    hash: String,
    tree_leaves: Vec<String>,
    challenges: Vec<String>,
    tmp_path: PathBuf,
}

async fn drain_shard_to_temp(
    index: u64,
    mut data: tokio::sync::mpsc::Receiver<MeshResult<bytes::Bytes>>,
    config: &TransferConfig,
    registry: &TempRegistry,
) -> MeshResult<TempShard> {
    let tmp_path = config
        .tmp_dir
        .join(format!("shardmesh-{}.data", uuid::Uuid::new_v4()));
    registry.lock().unwrap().insert(tmp_path.clone());

    let mut file = tokio::fs::File::create(&tmp_path)
        .await
        .map_err(|e| MeshError::Fatal(format!("Could not create shard temp file: {}", e)))?;
    let mut hasher = ShardHasher::new(index, config.audit_challenges);
    while let Some(chunk) = data.recv().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| MeshError::Fatal(format!("Shard temp file write failed: {}", e)))?;
    }
    file.flush()
        .await
        .map_err(|e| MeshError::Fatal(format!("Shard temp file write failed: {}", e)))?;

    let FinalizedShard {
        index,
        size,
        hash,
        tree,
    } = hasher.finalize();
    Ok(TempShard {
        index,
        size,
        hash,
        tree_leaves: tree.leaves,
        challenges: tree.challenges,
        tmp_path,
    })
}

fn flatten(result: Result<MeshResult<u64>, tokio::task::JoinError>) -> MeshResult<u64> {
    result.map_err(MeshError::from)?
}

async fn abort_tasks(tasks: &mut JoinSet<MeshResult<u64>>) {
    tasks.abort_all();
    while tasks.join_next().await.is_some() {}
}

async fn remove_temp_files(registry: &TempRegistry) {
    let paths: Vec<PathBuf> = registry.lock().unwrap().drain().collect();
    for path in paths {
        let _ = tokio::fs::remove_file(&path).await;
    }
}
