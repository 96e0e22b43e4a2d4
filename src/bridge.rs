/// Bridge Client Module
///
/// The authenticated HTTP surface of the bridge, in two layers:
///
/// - `BridgeTransport`: the raw request seam. The production implementation
///   drives `reqwest`; tests substitute counting or failing fakes to observe
///   retry behavior without a network.
/// - `BridgeClient`: URL composition, authentication, outcome normalization,
///   and one method per bridge endpoint.
///
/// Authentication applies at most one mode per request. A configured keypair
/// takes precedence: the request is signed with ECDSA over
/// `METHOD + " " + path + " " + canonical(payload)` where the canonical
/// payload is the JSON body for mutating verbs and the encoded querystring
/// for GET/DELETE; the signature travels in `x-signature` with the compressed
/// pubkey in `x-pubkey`. Otherwise basic credentials are attached with the
/// password pre-hashed (SHA-256 hex). Signed mutating payloads carry a
/// `__nonce` so the bridge can reject replays.
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::ClientOptions;
use crate::crypto;
use crate::error::{MeshError, MeshResult};
use crate::keypair::KeyPair;
use crate::logging;
use crate::models::{
    Bucket, Contact, FileEntry, Frame, Mirror, Operation, Pointer, ShardAllocation, ShardMeta,
    Token,
};
use crate::resilience::{retry_async, RetryConfig};

/// A fully prepared bridge request, ready for the transport.
#[derive(Debug, Clone)]
pub struct BridgeRequest {
    pub method: String,
    pub url: String,
    pub body: Option<Value>,
    pub headers: Vec<(String, String)>,
    pub basic_auth: Option<(String, String)>,
    pub timeout: Duration,
}

/// Raw transport outcome before normalization.
#[derive(Debug, Clone)]
pub struct BridgeResponse {
    pub status: u16,
    pub body: Value,
}

/// The raw request seam. Implementations return `Network` errors only;
/// HTTP-level failures come back as a `BridgeResponse` for normalization.
#[async_trait]
pub trait BridgeTransport: Send + Sync {
    async fn send(&self, request: BridgeRequest) -> MeshResult<BridgeResponse>;
}

/// Production transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BridgeTransport for HttpTransport {
    async fn send(&self, request: BridgeRequest) -> MeshResult<BridgeResponse> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| MeshError::Config(format!("Invalid HTTP method: {}", e)))?;
        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some((user, pass)) = &request.basic_auth {
            builder = builder.basic_auth(user, Some(pass));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| MeshError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| MeshError::Network(e.to_string()))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
        Ok(BridgeResponse { status, body })
    }
}

/// Client for the bridge HTTP surface.
pub struct BridgeClient {
    options: ClientOptions,
    basic_auth: Option<(String, String)>,
    keypair: Option<KeyPair>,
    transport: Box<dyn BridgeTransport>,
}

impl BridgeClient {
    /// Client over the production HTTP transport.
    pub fn new(options: ClientOptions) -> Self {
        Self::with_transport(options, Box::new(HttpTransport::new()))
    }

    /// Client over an explicit transport; the seam for tests.
    pub fn with_transport(options: ClientOptions, transport: Box<dyn BridgeTransport>) -> Self {
        Self {
            options,
            basic_auth: None,
            keypair: None,
            transport,
        }
    }

    /// Attach basic credentials. The password is hashed here, once.
    pub fn with_basic_auth(mut self, email: impl Into<String>, password: &str) -> Self {
        self.basic_auth = Some((email.into(), crypto::sha256_hex(password.as_bytes())));
        self
    }

    /// Attach a keypair. Takes precedence over basic credentials.
    pub fn with_keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn bridge_url(&self) -> &str {
        &self.options.bridge_url
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Issue one bridge request with the default timeout.
    pub async fn request(&self, method: &str, path: &str, payload: Value) -> MeshResult<Value> {
        self.request_with_timeout(method, path, payload, self.options.request_timeout())
            .await
    }

    /// Issue one bridge request, normalizing the outcome per the error
    /// policy: transport failure -> `Network`; status >= 400 -> `Bridge`
    /// carrying the body's `error` field (or the raw body); else the parsed
    /// JSON body.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        path: &str,
        payload: Value,
        timeout: Duration,
    ) -> MeshResult<Value> {
        self.request_inner(method, path, payload, timeout, &[]).await
    }

    async fn request_inner(
        &self,
        method: &str,
        path: &str,
        mut payload: Value,
        timeout: Duration,
        extra_headers: &[(String, String)],
    ) -> MeshResult<Value> {
        let query_style = matches!(method, "GET" | "DELETE");
        let mut headers: Vec<(String, String)> = extra_headers.to_vec();
        let mut basic_auth = None;

        if let Some(keypair) = &self.keypair {
            if !query_style {
                if let Some(object) = payload.as_object_mut() {
                    object.insert(
                        "__nonce".to_string(),
                        Value::String(uuid::Uuid::new_v4().to_string()),
                    );
                }
            }
            let canonical = if query_style {
                querystring(&payload)
            } else {
                serde_json::to_string(&payload)?
            };
            let contract = format!("{} {} {}", method, path, canonical);
            headers.push(("x-pubkey".to_string(), keypair.public_key_hex()));
            headers.push((
                "x-signature".to_string(),
                keypair.sign(contract.as_bytes()),
            ));
        } else if let Some((email, password_sha256)) = &self.basic_auth {
            basic_auth = Some((email.clone(), password_sha256.clone()));
        }

        let url = if query_style {
            let query = querystring(&payload);
            if query.is_empty() {
                format!("{}{}", self.options.bridge_url, path)
            } else {
                format!("{}{}?{}", self.options.bridge_url, path, query)
            }
        } else {
            format!("{}{}", self.options.bridge_url, path)
        };
        let body = if query_style { None } else { Some(payload) };

        logging::log_bridge_request(method, path);
        let response = self
            .transport
            .send(BridgeRequest {
                method: method.to_string(),
                url,
                body,
                headers,
                basic_auth,
                timeout,
            })
            .await?;

        if response.status >= 400 {
            let message = response
                .body
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| match &response.body {
                    Value::String(text) => text.clone(),
                    other => other.to_string(),
                });
            return Err(MeshError::Bridge {
                status: response.status,
                message,
            });
        }
        Ok(response.body)
    }

    // ===== GENERAL =====

    pub async fn get_info(&self) -> MeshResult<Value> {
        self.request("GET", "/", json!({})).await
    }

    pub async fn get_contact_list(&self, params: Value) -> MeshResult<Vec<Contact>> {
        let value = self.request("GET", "/contacts", params).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_contact(&self, node_id: &str) -> MeshResult<Contact> {
        let value = self
            .request("GET", &format!("/contacts/{}", node_id), json!({}))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    // ===== USERS & KEYS =====

    /// Register a user. The plaintext password never leaves the client;
    /// the body carries its SHA-256 hex.
    pub async fn create_user(&self, email: &str, password: &str) -> MeshResult<Value> {
        self.request(
            "POST",
            "/users",
            json!({
                "email": email,
                "password": crypto::sha256_hex(password.as_bytes()),
            }),
        )
        .await
    }

    pub async fn destroy_user(&self, email: &str) -> MeshResult<Value> {
        self.request("DELETE", &format!("/users/{}", email), json!({}))
            .await
    }

    pub async fn reset_password(&self, email: &str, password: &str) -> MeshResult<Value> {
        self.request(
            "PATCH",
            &format!("/users/{}", email),
            json!({
                "password": crypto::sha256_hex(password.as_bytes()),
            }),
        )
        .await
    }

    pub async fn get_public_keys(&self) -> MeshResult<Value> {
        self.request("GET", "/keys", json!({})).await
    }

    pub async fn add_public_key(&self, key: &str) -> MeshResult<Value> {
        self.request("POST", "/keys", json!({ "key": key })).await
    }

    pub async fn destroy_public_key(&self, key: &str) -> MeshResult<Value> {
        self.request("DELETE", &format!("/keys/{}", key), json!({}))
            .await
    }

    // ===== BUCKETS & FILES =====

    pub async fn get_buckets(&self) -> MeshResult<Vec<Bucket>> {
        let value = self.request("GET", "/buckets", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_bucket(&self, bucket_id: &str) -> MeshResult<Bucket> {
        let value = self
            .request("GET", &format!("/buckets/{}", bucket_id), json!({}))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn create_bucket(&self, name: Option<&str>) -> MeshResult<Bucket> {
        let payload = match name {
            Some(name) => json!({ "name": name }),
            None => json!({}),
        };
        let value = self.request("POST", "/buckets", payload).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn destroy_bucket(&self, bucket_id: &str) -> MeshResult<()> {
        self.request("DELETE", &format!("/buckets/{}", bucket_id), json!({}))
            .await?;
        Ok(())
    }

    pub async fn update_bucket(&self, bucket_id: &str, updates: Value) -> MeshResult<Bucket> {
        let value = self
            .request("PATCH", &format!("/buckets/{}", bucket_id), updates)
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn list_files_in_bucket(&self, bucket_id: &str) -> MeshResult<Vec<FileEntry>> {
        let value = self
            .request("GET", &format!("/buckets/{}/files", bucket_id), json!({}))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn remove_file_from_bucket(&self, bucket_id: &str, file_id: &str) -> MeshResult<()> {
        self.request(
            "DELETE",
            &format!("/buckets/{}/files/{}", bucket_id, file_id),
            json!({}),
        )
        .await?;
        Ok(())
    }

    /// Ask the bridge to establish additional mirrors of a file's shards.
    pub async fn replicate_file_from_bucket(
        &self,
        bucket_id: &str,
        file_id: &str,
        redundancy: u32,
    ) -> MeshResult<Vec<Mirror>> {
        let value = self
            .request(
                "POST",
                &format!("/buckets/{}/mirrors", bucket_id),
                json!({ "file": file_id, "redundancy": redundancy }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Obtain a short-lived PUSH or PULL capability for a bucket.
    pub async fn create_token(&self, bucket_id: &str, operation: Operation) -> MeshResult<Token> {
        let value = self
            .request(
                "POST",
                &format!("/buckets/{}/tokens", bucket_id),
                json!({ "operation": operation }),
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch one page of shard pointers for a file.
    pub async fn get_file_pointers(
        &self,
        bucket_id: &str,
        file_id: &str,
        token: &str,
        skip: u64,
        limit: u64,
        exclude: &[String],
    ) -> MeshResult<Vec<Pointer>> {
        let mut payload = json!({
            "token": token,
            "skip": skip.to_string(),
            "limit": limit.to_string(),
        });
        if !exclude.is_empty() {
            payload["exclude"] = Value::String(exclude.join(","));
        }
        let value = self
            .request(
                "GET",
                &format!("/buckets/{}/files/{}", bucket_id, file_id),
                payload,
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    // ===== STAGING FRAMES =====

    pub async fn create_file_staging_frame(&self) -> MeshResult<Frame> {
        let value = self.request("POST", "/frames", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_file_staging_frames(&self) -> MeshResult<Vec<Frame>> {
        let value = self.request("GET", "/frames", json!({})).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn get_file_staging_frame(&self, frame_id: &str) -> MeshResult<Frame> {
        let value = self
            .request("GET", &format!("/frames/{}", frame_id), json!({}))
            .await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn destroy_file_staging_frame(&self, frame_id: &str) -> MeshResult<()> {
        self.request("DELETE", &format!("/frames/{}", frame_id), json!({}))
            .await?;
        Ok(())
    }

    /// Negotiate a storage contract for one shard.
    ///
    /// Transient failures are retried with exponential back-off up to
    /// `retries` additional attempts; the caller observes only the final
    /// outcome.
    pub async fn add_shard_to_file_staging_frame(
        &self,
        frame_id: &str,
        meta: &ShardMeta,
        retries: u32,
    ) -> MeshResult<ShardAllocation> {
        let payload = serde_json::to_value(meta)?;
        let path = format!("/frames/{}", frame_id);
        let value = retry_async(
            || self.request("PUT", &path, payload.clone()),
            RetryConfig::with_budget(retries),
            MeshError::is_transient,
            "add_shard_to_file_staging_frame",
        )
        .await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Promote a staging frame into a bucket file entry. The PUSH token
    /// authorizing the upload travels in the `x-token` header.
    pub async fn create_entry_from_frame(
        &self,
        bucket_id: &str,
        frame_id: &str,
        mimetype: &str,
        filename: &str,
        token: &str,
    ) -> MeshResult<FileEntry> {
        let value = self
            .request_inner(
                "POST",
                &format!("/buckets/{}/files", bucket_id),
                json!({
                    "frame": frame_id,
                    "mimetype": mimetype,
                    "filename": filename,
                }),
                self.options.request_timeout(),
                &[("x-token".to_string(), token.to_string())],
            )
            .await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Deterministic querystring encoding of a flat JSON object. Key order
/// follows serde_json's object ordering, so the signed canonical string is
/// exactly what the URL carries.
fn querystring(payload: &Value) -> String {
    let Some(object) = payload.as_object() else {
        return String::new();
    };
    object
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            format!("{}={}", percent_encode(key), percent_encode(&value))
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char)
            }
            other => encoded.push_str(&format!("%{:02X}", other)),
        }
    }
    encoded
}
