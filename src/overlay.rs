/// Overlay Seam Module
///
/// The routing overlay (Kademlia contact lookup, RPC dispatch, pub/sub) is an
/// external library; the core only depends on this trait. Production wires
/// the real overlay, tests wire channel-backed fakes.
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MeshResult;
use crate::models::Contact;
use crate::protocol::RpcMessage;

/// Subscription events: the topic and the contact that published it.
pub type TopicEvent = (String, Contact);

#[async_trait]
pub trait Overlay: Send + Sync {
    /// Send an RPC to a contact and await its reply.
    async fn send(&self, contact: &Contact, message: RpcMessage) -> MeshResult<RpcMessage>;

    /// Publish our contact under a topic.
    async fn publish(&self, topic: &str, contact: &Contact) -> MeshResult<()>;

    /// Subscribe to a topic, receiving publishes as channel events.
    async fn subscribe(&self, topic: &str) -> MeshResult<mpsc::Receiver<TopicEvent>>;
}
