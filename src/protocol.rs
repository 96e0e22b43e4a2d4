/// Peer-Message Protocol Module
///
/// Every RPC exchanged on the overlay travels in a signed envelope. Before
/// send, the sender stamps `params.nonce` (unix milliseconds) and signs the
/// canonical string `method || id || JSON(params without signature)` with a
/// recoverable ECDSA signature. On receive, the verifier gates, in order:
/// protocol version compatibility, nonce freshness, and signature recovery
/// against the claimed contact's nodeID. Recovered pubkeys are cached per
/// nodeID so repeat senders verify on the cheaper non-recoverable path.
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use secp256k1::{PublicKey, Secp256k1, VerifyOnly};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ProtocolConfig;
use crate::crypto;
use crate::error::{MeshError, MeshResult};
use crate::keypair::{self, KeyPair};
use crate::models::Contact;

/// Overlay protocol version spoken by this client
pub const PROTOCOL_VERSION: &str = "1.2.0";

/// Maximum accepted nonce age in milliseconds
pub const NONCE_TOLERANCE_MS: i64 = 5_000;

/// An overlay RPC envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcMessage {
    pub method: String,
    pub id: String,
    pub params: Value,
}

impl RpcMessage {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self {
            method: method.into(),
            id: uuid::Uuid::new_v4().to_string(),
            params,
        }
    }

    /// An error reply echoing the request id.
    pub fn error_reply(id: &str, message: &str) -> Self {
        Self {
            method: "ERROR".to_string(),
            id: id.to_string(),
            params: serde_json::json!({ "error": message }),
        }
    }

    /// The error string carried by a reply, if any.
    pub fn error(&self) -> Option<&str> {
        self.params.get("error").and_then(Value::as_str)
    }
}

/// Signs outbound and verifies inbound peer messages.
pub struct Protocol {
    keypair: KeyPair,
    nonce_tolerance_ms: i64,
    secp: Secp256k1<VerifyOnly>,
    pubkey_cache: Mutex<LruCache<String, PublicKey>>,
}

impl Protocol {
    pub fn new(keypair: KeyPair, config: &ProtocolConfig) -> Self {
        let cache_size = NonZeroUsize::new(config.pubkey_cache_size.max(1)).expect("nonzero");
        Self {
            keypair,
            nonce_tolerance_ms: config.nonce_tolerance_ms,
            secp: Secp256k1::verification_only(),
            pubkey_cache: Mutex::new(LruCache::new(cache_size)),
        }
    }

    /// The signing identity's nodeID.
    pub fn node_id(&self) -> String {
        self.keypair.node_id()
    }

    /// Stamp `params.nonce` and attach `params.signature`.
    pub fn sign_message(&self, message: &mut RpcMessage) -> MeshResult<()> {
        let params = message
            .params
            .as_object_mut()
            .ok_or_else(|| MeshError::Protocol("Message params must be an object".to_string()))?;
        params.insert(
            "nonce".to_string(),
            Value::from(chrono::Utc::now().timestamp_millis()),
        );
        let canonical = canonical_string(&message.method, &message.id, &message.params);
        let signature = self.keypair.sign_recoverable(canonical.as_bytes());
        message
            .params
            .as_object_mut()
            .expect("params still an object")
            .insert("signature".to_string(), Value::String(signature));
        Ok(())
    }

    /// Enforce version compatibility, nonce freshness, and signature
    /// authenticity against the claimed contact.
    pub fn verify_message(&self, message: &RpcMessage, contact: &Contact) -> MeshResult<()> {
        if !version_compatible(&contact.protocol) {
            return Err(MeshError::Protocol(
                "Protocol version is incompatible".to_string(),
            ));
        }

        let nonce = message
            .params
            .get("nonce")
            .and_then(Value::as_i64)
            .ok_or_else(|| MeshError::Protocol("Message signature expired".to_string()))?;
        if chrono::Utc::now().timestamp_millis() - nonce > self.nonce_tolerance_ms {
            return Err(MeshError::Protocol("Message signature expired".to_string()));
        }

        let signature = message
            .params
            .get("signature")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                MeshError::Protocol("Signature verification failed".to_string())
            })?;
        let canonical = canonical_string(&message.method, &message.id, &message.params);

        let cached = self
            .pubkey_cache
            .lock()
            .unwrap()
            .get(&contact.node_id)
            .copied();
        if let Some(public_key) = cached {
            let standard = keypair::to_standard(signature)
                .map_err(|_| MeshError::Protocol("Signature verification failed".to_string()))?;
            let digest = secp256k1::Message::from_digest(crypto::sha256(canonical.as_bytes()));
            return self
                .secp
                .verify_ecdsa(&digest, &standard, &public_key)
                .map_err(|_| MeshError::Protocol("Signature verification failed".to_string()));
        }

        let recovered = keypair::recover(canonical.as_bytes(), signature)
            .map_err(|_| MeshError::Protocol("Signature verification failed".to_string()))?;
        if crypto::rmd160_sha256_hex(&recovered.serialize()) != contact.node_id {
            return Err(MeshError::Protocol(
                "Signature verification failed".to_string(),
            ));
        }
        self.pubkey_cache
            .lock()
            .unwrap()
            .put(contact.node_id.clone(), recovered);
        Ok(())
    }
}

/// What the network dispatch task should do with an inbound message.
#[derive(Debug)]
pub enum Dispatch {
    /// Verified; hand to the application handler
    Deliver(RpcMessage),
    /// Send this reply and drop the message
    Reply(RpcMessage),
    /// Drop silently, with the reason for the log
    Drop(String),
}

/// Inbound gate combining the rate limiter and message verification.
pub struct Dispatcher {
    protocol: Protocol,
    limiter: crate::rate_limit::MessageRateLimiter,
}

impl Dispatcher {
    pub fn new(protocol: Protocol, limiter: crate::rate_limit::MessageRateLimiter) -> Self {
        Self { protocol, limiter }
    }

    pub fn protocol(&self) -> &Protocol {
        &self.protocol
    }

    pub fn handle_inbound(&self, message: RpcMessage, contact: &Contact) -> Dispatch {
        if !self.limiter.check(&contact.node_id) {
            crate::logging::log_peer_event("rate limited inbound message", &contact.node_id);
            return Dispatch::Reply(RpcMessage::error_reply(
                &message.id,
                "Rate limit exceeded",
            ));
        }
        match self.protocol.verify_message(&message, contact) {
            Ok(()) => Dispatch::Deliver(message),
            Err(error) => {
                crate::logging::log_peer_event("dropping unverifiable message", &contact.node_id);
                Dispatch::Drop(error.to_string())
            }
        }
    }
}

/// `method || id || JSON(params minus signature)`
fn canonical_string(method: &str, id: &str, params: &Value) -> String {
    let mut stripped = params.clone();
    if let Some(object) = stripped.as_object_mut() {
        object.remove("signature");
    }
    format!("{}{}{}", method, id, stripped)
}

/// Same major.minor as our own protocol version.
fn version_compatible(theirs: &str) -> bool {
    fn major_minor(version: &str) -> Option<(u32, u32)> {
        let mut parts = version.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        Some((major, minor))
    }
    match (major_minor(PROTOCOL_VERSION), major_minor(theirs)) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientOptions;
    use serde_json::json;

    fn protocol_for(keypair: KeyPair) -> Protocol {
        Protocol::new(keypair, &ClientOptions::with_bridge_url("http://x").protocol)
    }

    fn contact_for(keypair: &KeyPair) -> Contact {
        Contact {
            address: "127.0.0.1".into(),
            port: 4000,
            node_id: keypair.node_id(),
            protocol: PROTOCOL_VERSION.into(),
        }
    }

    #[test]
    fn test_signed_message_verifies() {
        let sender = KeyPair::generate();
        let contact = contact_for(&sender);
        let signer = protocol_for(sender);
        let receiver = protocol_for(KeyPair::generate());

        let mut message = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut message).unwrap();
        receiver.verify_message(&message, &contact).unwrap();

        // Second verification exercises the pubkey cache path
        let mut repeat = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut repeat).unwrap();
        receiver.verify_message(&repeat, &contact).unwrap();
    }

    #[test]
    fn test_stale_nonce_is_rejected() {
        let sender = KeyPair::generate();
        let contact = contact_for(&sender);
        let signer = protocol_for(sender);
        let receiver = protocol_for(KeyPair::generate());

        let mut message = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut message).unwrap();
        // Age the nonce far past tolerance and re-sign so only freshness fails
        let stale = chrono::Utc::now().timestamp_millis() - 10_000_000;
        message.params["nonce"] = json!(stale);
        let canonical = canonical_string(&message.method, &message.id, &message.params);
        message.params["signature"] =
            json!(signer.keypair.sign_recoverable(canonical.as_bytes()));

        let err = receiver.verify_message(&message, &contact).unwrap_err();
        assert_eq!(err.to_string(), "Message signature expired");
    }

    #[test]
    fn test_incompatible_version_is_rejected() {
        let sender = KeyPair::generate();
        let mut contact = contact_for(&sender);
        contact.protocol = "0.0.0".into();
        let signer = protocol_for(sender);
        let receiver = protocol_for(KeyPair::generate());

        let mut message = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut message).unwrap();
        let err = receiver.verify_message(&message, &contact).unwrap_err();
        assert_eq!(err.to_string(), "Protocol version is incompatible");
    }

    #[test]
    fn test_wrong_node_id_is_rejected() {
        let sender = KeyPair::generate();
        let impostor = KeyPair::generate();
        let mut contact = contact_for(&sender);
        contact.node_id = impostor.node_id();
        let signer = protocol_for(sender);
        let receiver = protocol_for(KeyPair::generate());

        let mut message = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut message).unwrap();
        let err = receiver.verify_message(&message, &contact).unwrap_err();
        assert_eq!(err.to_string(), "Signature verification failed");
    }

    #[test]
    fn test_tampered_params_fail_verification() {
        let sender = KeyPair::generate();
        let contact = contact_for(&sender);
        let signer = protocol_for(sender);
        let receiver = protocol_for(KeyPair::generate());

        let mut message = RpcMessage::new("STORE", json!({ "hash": "aaaa" }));
        signer.sign_message(&mut message).unwrap();
        message.params["hash"] = json!("bbbb");
        let err = receiver.verify_message(&message, &contact).unwrap_err();
        assert_eq!(err.to_string(), "Signature verification failed");
    }

    #[test]
    fn test_dispatcher_replies_when_rate_limited() {
        let sender = KeyPair::generate();
        let contact = contact_for(&sender);
        let signer = protocol_for(sender);
        let dispatcher = Dispatcher::new(
            protocol_for(KeyPair::generate()),
            crate::rate_limit::MessageRateLimiter::new(1),
        );

        let mut first = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut first).unwrap();
        assert!(matches!(
            dispatcher.handle_inbound(first, &contact),
            Dispatch::Deliver(_)
        ));

        let mut second = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut second).unwrap();
        let id = second.id.clone();
        match dispatcher.handle_inbound(second, &contact) {
            Dispatch::Reply(reply) => {
                assert_eq!(reply.id, id);
                assert_eq!(reply.error(), Some("Rate limit exceeded"));
            }
            other => panic!("expected rate limit reply, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatcher_drops_unverifiable_messages() {
        let sender = KeyPair::generate();
        let mut contact = contact_for(&sender);
        contact.protocol = "9.9.9".into();
        let signer = protocol_for(sender);
        let dispatcher = Dispatcher::new(
            protocol_for(KeyPair::generate()),
            crate::rate_limit::MessageRateLimiter::new(10),
        );

        let mut message = RpcMessage::new("PING", json!({}));
        signer.sign_message(&mut message).unwrap();
        match dispatcher.handle_inbound(message, &contact) {
            Dispatch::Drop(reason) => {
                assert_eq!(reason, "Protocol version is incompatible");
            }
            other => panic!("expected drop, got {:?}", other),
        }
    }

    #[test]
    fn test_version_compare_ignores_patch() {
        assert!(version_compatible("1.2.9"));
        assert!(!version_compatible("1.3.0"));
        assert!(!version_compatible("0.0.0"));
        assert!(!version_compatible("bogus"));
    }
}
