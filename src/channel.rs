/// Data-Channel Client Module
///
/// An outbound framed connection to a single farmer, used to move exactly one
/// shard. The wire is length-prefixed: the first frame is the JSON handshake
/// `{token, hash, operation}`; a PUSH then streams raw data frames and waits
/// for one JSON acknowledgement frame from the farmer, while a PULL receives
/// raw data frames terminated by a zero-length frame.
///
/// Every frame send and receive is bounded by the channel idle timeout. Any
/// failure is a `Transfer` error, which the upload orchestrator feeds into
/// its retry/reassign state machine.
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::debug;

use crate::demux::CHUNK_SIZE;
use crate::error::{MeshError, MeshResult};
use crate::models::{Contact, Operation};
use crate::mux::ShardSource;
use crate::resilience::with_timeout;

/// Connection lifecycle, tracked for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Active,
    Closed,
    Errored,
}

#[derive(Serialize, Deserialize)]
struct Handshake {
    token: String,
    hash: String,
    operation: Operation,
}

#[derive(Deserialize)]
struct Acknowledgement {
    #[serde(default)]
    error: Option<String>,
}

/// One shard transfer over one connection; consumed by `push` or `pull`.
#[async_trait]
pub trait ShardChannel: Send {
    /// Stream the file at `source` to the farmer and await its receipt
    /// acknowledgement.
    async fn push(self: Box<Self>, token: &str, hash: &str, source: &Path) -> MeshResult<()>;

    /// Request the named shard and return its byte stream.
    async fn pull(self: Box<Self>, token: &str, hash: &str) -> MeshResult<ShardSource>;
}

/// Seam for opening shard channels; tests substitute fakes.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, contact: &Contact) -> MeshResult<Box<dyn ShardChannel>>;
}

/// Production data channel over TCP.
#[derive(Debug)]
pub struct DataChannel {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
    idle_timeout: Duration,
    state: ChannelState,
    peer: String,
}

impl DataChannel {
    /// Connect to a farmer's data-channel endpoint.
    pub async fn connect(contact: &Contact, idle_timeout: Duration) -> MeshResult<Self> {
        let peer = format!("{}:{}", contact.address, contact.port);
        debug!(peer = %peer, state = ?ChannelState::Connecting, "opening data channel");
        let stream = with_timeout(TcpStream::connect(&peer), idle_timeout, "data channel connect")
            .await
            .map_err(|_| MeshError::Transfer(format!("Connection to {} timed out", peer)))?
            .map_err(|e| MeshError::Transfer(format!("Connection to {} failed: {}", peer, e)))?;
        Ok(Self {
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
            idle_timeout,
            state: ChannelState::Open,
            peer,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    async fn send_frame(&mut self, frame: Bytes) -> MeshResult<()> {
        with_timeout(self.framed.send(frame), self.idle_timeout, "data channel write")
            .await
            .map_err(|_| {
                MeshError::Transfer(format!("Data channel to {} idled out", self.peer))
            })?
            .map_err(|e| MeshError::Transfer(format!("Frame write to {} failed: {}", self.peer, e)))
    }

    async fn recv_frame(&mut self) -> MeshResult<Bytes> {
        let frame = with_timeout(self.framed.next(), self.idle_timeout, "data channel read")
            .await
            .map_err(|_| MeshError::Transfer(format!("Data channel to {} idled out", self.peer)))?
            .ok_or_else(|| {
                MeshError::Transfer(format!("Data channel to {} closed unexpectedly", self.peer))
            })?
            .map_err(|e| {
                MeshError::Transfer(format!("Frame read from {} failed: {}", self.peer, e))
            })?;
        Ok(frame.freeze())
    }

    async fn handshake(&mut self, token: &str, hash: &str, operation: Operation) -> MeshResult<()> {
        let handshake = Handshake {
            token: token.to_string(),
            hash: hash.to_string(),
            operation,
        };
        let frame = Bytes::from(serde_json::to_vec(&handshake)?);
        self.send_frame(frame).await?;
        self.state = ChannelState::Active;
        Ok(())
    }
}

#[async_trait]
impl ShardChannel for DataChannel {
    async fn push(mut self: Box<Self>, token: &str, hash: &str, source: &Path) -> MeshResult<()> {
        self.handshake(token, hash, Operation::Push).await?;

        let mut file = tokio::fs::File::open(source).await.map_err(|e| {
            MeshError::Io(format!("Shard temp file {:?} unreadable: {}", source, e))
        })?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            self.send_frame(Bytes::copy_from_slice(&buffer[..read]))
                .await?;
        }

        // The farmer acknowledges once the full shard is on disk
        let ack = self.recv_frame().await?;
        let ack: Acknowledgement = serde_json::from_slice(&ack).map_err(|e| {
            MeshError::Transfer(format!("Malformed acknowledgement from {}: {}", self.peer, e))
        })?;
        if let Some(error) = ack.error {
            self.state = ChannelState::Errored;
            return Err(MeshError::Transfer(format!(
                "Farmer {} rejected shard: {}",
                self.peer, error
            )));
        }
        self.state = ChannelState::Closed;
        debug!(peer = %self.peer, hash, "shard push acknowledged");
        Ok(())
    }

    async fn pull(mut self: Box<Self>, token: &str, hash: &str) -> MeshResult<ShardSource> {
        self.handshake(token, hash, Operation::Pull).await?;
        let peer = self.peer.clone();
        let idle_timeout = self.idle_timeout;
        let framed = self.framed;

        let stream = futures::stream::unfold(Some(framed), move |state| {
            let peer = peer.clone();
            async move {
                let mut framed = state?;
                let next = with_timeout(framed.next(), idle_timeout, "data channel read").await;
                match next {
                    Err(_) => Some((
                        Err(MeshError::Transfer(format!(
                            "Data channel to {} idled out",
                            peer
                        ))),
                        None,
                    )),
                    Ok(None) => Some((
                        Err(MeshError::Transfer(format!(
                            "Data channel to {} closed before the terminal frame",
                            peer
                        ))),
                        None,
                    )),
                    Ok(Some(Err(e))) => Some((
                        Err(MeshError::Transfer(format!(
                            "Frame read from {} failed: {}",
                            peer, e
                        ))),
                        None,
                    )),
                    // Zero-length terminal frame: the farmer is done
                    Ok(Some(Ok(frame))) if frame.is_empty() => None,
                    Ok(Some(Ok(frame))) => Some((Ok(frame.freeze()), Some(framed))),
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Factory producing TCP data channels.
pub struct TcpChannelFactory {
    idle_timeout: Duration,
}

impl TcpChannelFactory {
    pub fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn open(&self, contact: &Contact) -> MeshResult<Box<dyn ShardChannel>> {
        Ok(Box::new(DataChannel::connect(contact, self.idle_timeout).await?))
    }
}
