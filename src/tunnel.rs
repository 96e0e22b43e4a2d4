/// Tunnel Discovery Module
///
/// NAT-restricted nodes reach the network through tunneling peers. Relay
/// availability travels over two pub/sub topics: a node running a tunnel
/// server publishes `0e00` while it has capacity and `0e01` when it locks up,
/// and every node maintains a bounded set of known tunnelers from those
/// announcements.
///
/// The client side of the subprotocol: probe a seed to learn whether we are
/// reachable, ask a neighbor for a tunneler when we are not, then open the
/// tunnel and subscribe to further announcements.
use std::sync::{Arc, Mutex};

use serde_json::json;
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::logging;
use crate::models::Contact;
use crate::overlay::Overlay;
use crate::protocol::{Protocol, RpcMessage};

/// Topic announcing an available tunnel
pub const TOPIC_TUNNEL_AVAILABLE: &str = "0e00";
/// Topic announcing a tunnel going away
pub const TOPIC_TUNNEL_UNAVAILABLE: &str = "0e01";
/// Upper bound on remembered tunnelers
pub const MAX_TUNNELERS: usize = 20;

/// Capacity accounting for a locally run tunnel server.
///
/// `lock`/`unlock` mirror the server's connection lifecycle and return the
/// topic to publish, if any.
#[derive(Debug)]
pub struct TunnelServerState {
    capacity: usize,
    active: usize,
}

impl TunnelServerState {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            active: 0,
        }
    }

    pub fn has_tunnel_available(&self) -> bool {
        self.active < self.capacity
    }

    /// A tunnel was claimed. Publishes unavailability once full.
    pub fn lock(&mut self) -> Option<&'static str> {
        self.active = (self.active + 1).min(self.capacity);
        if self.has_tunnel_available() {
            None
        } else {
            Some(TOPIC_TUNNEL_UNAVAILABLE)
        }
    }

    /// A tunnel was released.
    pub fn unlock(&mut self) -> &'static str {
        self.active = self.active.saturating_sub(1);
        if self.has_tunnel_available() {
            TOPIC_TUNNEL_AVAILABLE
        } else {
            TOPIC_TUNNEL_UNAVAILABLE
        }
    }
}

/// Tunnel discovery state for one node.
pub struct TunnelManager {
    overlay: Arc<dyn Overlay>,
    protocol: Arc<Protocol>,
    contact: Contact,
    tunnelers: Mutex<Vec<Contact>>,
}

impl TunnelManager {
    pub fn new(overlay: Arc<dyn Overlay>, protocol: Arc<Protocol>, contact: Contact) -> Self {
        Self {
            overlay,
            protocol,
            contact,
            tunnelers: Mutex::new(Vec::new()),
        }
    }

    /// Known tunnelers, most recently announced last.
    pub fn tunnelers(&self) -> Vec<Contact> {
        self.tunnelers.lock().unwrap().clone()
    }

    /// Publish our own tunnel availability.
    pub async fn announce(&self, topic: &'static str) -> MeshResult<()> {
        debug!(topic, "announcing tunnel state");
        self.overlay.publish(topic, &self.contact).await
    }

    /// Track an announcement from another node. Available tunnelers are
    /// added only while there is room; unavailability always removes.
    pub fn handle_announcement(&self, topic: &str, contact: Contact) {
        let mut tunnelers = self.tunnelers.lock().unwrap();
        match topic {
            TOPIC_TUNNEL_AVAILABLE => {
                let known = tunnelers.iter().any(|t| t.node_id == contact.node_id);
                if !known && tunnelers.len() < MAX_TUNNELERS {
                    logging::log_peer_event("tunneler available", &contact.node_id);
                    tunnelers.push(contact);
                }
            }
            TOPIC_TUNNEL_UNAVAILABLE => {
                logging::log_peer_event("tunneler unavailable", &contact.node_id);
                tunnelers.retain(|t| t.node_id != contact.node_id);
            }
            _ => {}
        }
    }

    /// Subscribe to both tunnel topics and fold announcements into the
    /// tunneler set until the overlay closes the subscriptions.
    pub async fn listen(self: &Arc<Self>) -> MeshResult<()> {
        for topic in [TOPIC_TUNNEL_AVAILABLE, TOPIC_TUNNEL_UNAVAILABLE] {
            let mut events = self.overlay.subscribe(topic).await?;
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                while let Some((topic, contact)) = events.recv().await {
                    manager.handle_announcement(&topic, contact);
                }
            });
        }
        Ok(())
    }

    /// Ask `seed` to probe us back. An error reply means we are not
    /// reachable and need a tunnel.
    pub async fn request_probe(&self, seed: &Contact) -> MeshResult<()> {
        let mut message = RpcMessage::new("PROBE", json!({}));
        self.protocol.sign_message(&mut message)?;
        let reply = self.overlay.send(seed, message).await?;
        if let Some(error) = reply.error() {
            return Err(MeshError::Network(format!("Probe failed: {}", error)));
        }
        Ok(())
    }

    /// Ask neighbors for a known tunneler contact.
    pub async fn find_tunnel(&self, neighbors: &[Contact]) -> MeshResult<Contact> {
        if neighbors.is_empty() {
            return Err(MeshError::Fatal(
                "Could not find a neighbor to query for tunnels".to_string(),
            ));
        }
        for neighbor in neighbors {
            let mut message = RpcMessage::new("FIND_TUNNEL", json!({}));
            self.protocol.sign_message(&mut message)?;
            match self.overlay.send(neighbor, message).await {
                Ok(reply) => {
                    if let Some(error) = reply.error() {
                        warn!(node = %neighbor.node_id, "FIND_TUNNEL rejected: {}", error);
                        continue;
                    }
                    let tunnels = reply.params.get("tunnels").cloned().unwrap_or(json!([]));
                    if let Ok(contacts) =
                        serde_json::from_value::<Vec<Contact>>(tunnels)
                    {
                        if let Some(contact) = contacts.into_iter().next() {
                            return Ok(contact);
                        }
                    }
                }
                Err(error) => {
                    warn!(node = %neighbor.node_id, "FIND_TUNNEL failed: {}", error);
                }
            }
        }
        Err(MeshError::Network(
            "No tunnelers were returned by any neighbor".to_string(),
        ))
    }

    /// Open a tunnel through `tunneler`.
    pub async fn establish_tunnel(&self, tunneler: &Contact) -> MeshResult<()> {
        let mut message = RpcMessage::new("OPEN_TUNNEL", json!({}));
        self.protocol.sign_message(&mut message)?;
        let reply = self.overlay.send(tunneler, message).await?;
        if let Some(error) = reply.error() {
            return Err(MeshError::Network(format!(
                "Tunnel establishment failed: {}",
                error
            )));
        }
        logging::log_peer_event("tunnel established", &tunneler.node_id);
        Ok(())
    }

    /// Full client-side setup: probe, find a tunneler if unreachable, open
    /// the tunnel, and keep listening for announcements.
    ///
    /// Returns the tunneler in use, or `None` when no tunnel was needed.
    pub async fn setup(
        self: &Arc<Self>,
        seeds: &[Contact],
        neighbors: &[Contact],
    ) -> MeshResult<Option<Contact>> {
        let seed = seeds.first().ok_or_else(|| {
            MeshError::Fatal("Could not find a neighbor to query for probe".to_string())
        })?;
        if self.request_probe(seed).await.is_ok() {
            debug!("node is reachable, no tunnel required");
            return Ok(None);
        }
        let tunneler = self.find_tunnel(neighbors).await?;
        self.establish_tunnel(&tunneler).await?;
        self.listen().await?;
        Ok(Some(tunneler))
    }
}
