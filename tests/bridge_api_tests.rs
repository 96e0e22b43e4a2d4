/// Bridge API Integration Tests
///
/// Exercises the bridge client against a real HTTP server (wiremock):
/// default URI resolution from the environment, credential hashing,
/// signed-request headers, querystring composition, and error
/// normalization as they appear on the wire.
use serde_json::json;
use wiremock::matchers::{body_json, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

use shardmesh::bridge::BridgeClient;
use shardmesh::config::{ClientOptions, BRIDGE_ENV_VAR};
use shardmesh::keypair::{self, KeyPair};
use shardmesh::models::Operation;

#[test]
fn test_default_uri_comes_from_environment() {
    std::env::set_var(BRIDGE_ENV_VAR, "https://staging.api.storj.io");
    let options = ClientOptions::default();
    std::env::remove_var(BRIDGE_ENV_VAR);
    assert_eq!(options.bridge_url, "https://staging.api.storj.io");
}

#[tokio::test]
async fn test_create_user_sends_hashed_password() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/users"))
        .and(body_json(json!({
            "email": "g@s.io",
            "password": "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "email": "g@s.io" })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BridgeClient::new(ClientOptions::with_bridge_url(server.uri()));
    let created = client.create_user("g@s.io", "password").await.unwrap();
    assert_eq!(created["email"], "g@s.io");
}

#[tokio::test]
async fn test_signed_request_carries_verifiable_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buckets"))
        .and(header_exists("x-pubkey"))
        .and(header_exists("x-signature"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let keypair = KeyPair::generate();
    let pubkey_hex = keypair.public_key_hex();
    let client =
        BridgeClient::new(ClientOptions::with_bridge_url(server.uri())).with_keypair(keypair);
    client.get_buckets().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let request: &Request = &requests[0];
    let signature = request.headers.get("x-signature").unwrap().to_str().unwrap();
    let pubkey = request.headers.get("x-pubkey").unwrap().to_str().unwrap();
    assert_eq!(pubkey, pubkey_hex);
    // GET with no params signs over an empty querystring
    keypair::verify(b"GET /buckets ", signature, pubkey).unwrap();
}

#[tokio::test]
async fn test_basic_auth_uses_hashed_password() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buckets"))
        .and(header_exists("authorization"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = BridgeClient::new(ClientOptions::with_bridge_url(server.uri()))
        .with_basic_auth("g@s.io", "password");
    client.get_buckets().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let authorization = requests[0]
        .headers
        .get("authorization")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    // Credentials are base64("email:sha256hex(password)")
    let expected = format!(
        "Basic {}",
        base64_encode("g@s.io:5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8")
    );
    assert_eq!(authorization, expected);
}

#[tokio::test]
async fn test_pointer_page_query_parameters() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buckets/b1/files/f1"))
        .and(query_param("token", "pull-token"))
        .and(query_param("skip", "6"))
        .and(query_param("limit", "3"))
        .and(query_param("exclude", "node-a,node-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let client = BridgeClient::new(ClientOptions::with_bridge_url(server.uri()));
    let pointers = client
        .get_file_pointers(
            "b1",
            "f1",
            "pull-token",
            6,
            3,
            &["node-a".to_string(), "node-b".to_string()],
        )
        .await
        .unwrap();
    assert!(pointers.is_empty());
}

#[tokio::test]
async fn test_bridge_error_body_is_normalized() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/buckets/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "error": "Bucket not found" })),
        )
        .mount(&server)
        .await;

    let client = BridgeClient::new(ClientOptions::with_bridge_url(server.uri()));
    let err = client.get_bucket("missing").await.unwrap_err();
    assert_eq!(err.to_string(), "Bridge error (404): Bucket not found");
}

#[tokio::test]
async fn test_unreachable_bridge_is_a_network_error() {
    // Nothing listens here
    let client = BridgeClient::new(ClientOptions::with_bridge_url("http://127.0.0.1:1"));
    let err = client.get_info().await.unwrap_err();
    assert!(matches!(err, shardmesh::MeshError::Network(_)));
}

#[tokio::test]
async fn test_create_token_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/buckets/b1/tokens"))
        .and(body_json(json!({ "operation": "PULL" })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "token": "capability-1",
            "operation": "PULL",
            "expires": "2026-08-01T00:00:00Z",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = BridgeClient::new(ClientOptions::with_bridge_url(server.uri()));
    let token = client.create_token("b1", Operation::Pull).await.unwrap();
    assert_eq!(token.token, "capability-1");
    assert_eq!(token.operation, Some(Operation::Pull));
}

fn base64_encode(input: &str) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let bytes = input.as_bytes();
    let mut encoded = String::new();
    for chunk in bytes.chunks(3) {
        let mut buffer = [0u8; 3];
        buffer[..chunk.len()].copy_from_slice(chunk);
        let n = u32::from(buffer[0]) << 16 | u32::from(buffer[1]) << 8 | u32::from(buffer[2]);
        encoded.push(ALPHABET[(n >> 18) as usize & 63] as char);
        encoded.push(ALPHABET[(n >> 12) as usize & 63] as char);
        encoded.push(if chunk.len() > 1 {
            ALPHABET[(n >> 6) as usize & 63] as char
        } else {
            '='
        });
        encoded.push(if chunk.len() > 2 {
            ALPHABET[n as usize & 63] as char
        } else {
            '='
        });
    }
    encoded
}
