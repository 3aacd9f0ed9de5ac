//! Shared harness for integration tests: a real server on a free port,
//! static auth/record backends, and small WebSocket client helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use collabd::{
    AccessError, AuthService, AuthUser, HookEmitter, RealtimeConfig, RealtimeServer, Record,
    RecordStore,
};

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";
pub const CAROL_TOKEN: &str = "carol-token";

/// Static session table: two editors and one read-only viewer, two known
/// records.
pub struct TestAuth {
    sessions: HashMap<String, AuthUser>,
    editors: HashSet<String>,
    known_records: HashSet<String>,
}

impl TestAuth {
    pub fn new() -> Self {
        let mut sessions = HashMap::new();
        sessions.insert(
            ALICE_TOKEN.to_string(),
            AuthUser { id: "u-alice".into(), username: "Alice".into(), role: "editor".into() },
        );
        sessions.insert(
            BOB_TOKEN.to_string(),
            AuthUser { id: "u-bob".into(), username: "Bob".into(), role: "editor".into() },
        );
        sessions.insert(
            CAROL_TOKEN.to_string(),
            AuthUser { id: "u-carol".into(), username: "Carol".into(), role: "viewer".into() },
        );
        Self {
            sessions,
            editors: ["u-alice".to_string(), "u-bob".to_string()].into_iter().collect(),
            known_records: ["doc-1".to_string(), "doc-2".to_string()].into_iter().collect(),
        }
    }
}

#[async_trait]
impl AuthService for TestAuth {
    async fn validate_session(&self, token: &str) -> Option<AuthUser> {
        self.sessions.get(token).cloned()
    }

    async fn user_can(
        &self,
        user: &AuthUser,
        action: &str,
        record_id: &str,
    ) -> Result<bool, AccessError> {
        if !self.known_records.contains(record_id) {
            return Err(AccessError::RecordNotFound);
        }
        match action {
            "records:view" => Ok(true),
            "records:edit" => Ok(self.editors.contains(&user.id)),
            _ => Ok(false),
        }
    }
}

pub struct TestRecords {
    contents: HashMap<String, String>,
}

impl TestRecords {
    pub fn new() -> Self {
        let mut contents = HashMap::new();
        contents.insert("doc-1".to_string(), "Hello".to_string());
        contents.insert("doc-2".to_string(), String::new());
        Self { contents }
    }
}

#[async_trait]
impl RecordStore for TestRecords {
    async fn get_record(&self, record_id: &str) -> Result<Option<Record>, AccessError> {
        Ok(self.contents.get(record_id).map(|content| Record {
            id: record_id.to_string(),
            content: content.clone(),
        }))
    }
}

/// A config suited to tests: snapshots off unless a test opts in.
pub fn test_config() -> RealtimeConfig {
    let mut config = RealtimeConfig::default();
    config.snapshots.enabled = false;
    config
}

/// Start a server on a free port with the static backends.
pub async fn start_test_server(config: RealtimeConfig) -> (Arc<RealtimeServer>, SocketAddr) {
    start_test_server_with_hooks(config, HookEmitter::disabled()).await
}

pub async fn start_test_server_with_hooks(
    config: RealtimeConfig,
    hooks: HookEmitter,
) -> (Arc<RealtimeServer>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = RealtimeServer::new(
        config,
        Arc::new(TestAuth::new()),
        Arc::new(TestRecords::new()),
        hooks,
    )
    .await;
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, addr)
}

pub fn room_url(addr: SocketAddr, record_id: &str) -> String {
    format!("ws://{addr}/realtime/records/{record_id}")
}

/// Connect with an Authorization header.
pub async fn connect(addr: SocketAddr, token: &str, record_id: &str) -> WsClient {
    let mut request = room_url(addr, record_id).into_client_request().unwrap();
    request.headers_mut().insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
    );
    let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    ws
}

/// Connect carrying the token as an `auth.<token>` subprotocol. Returns the
/// stream and the subprotocol the server echoed back, if any.
pub async fn connect_with_subprotocol(
    addr: SocketAddr,
    token: &str,
    record_id: &str,
) -> (WsClient, Option<String>) {
    let mut request = room_url(addr, record_id).into_client_request().unwrap();
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_str(&format!("auth.{token}")).unwrap(),
    );
    let (ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    let echoed = response
        .headers()
        .get(SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    (ws, echoed)
}

pub async fn send_json(ws: &mut WsClient, value: serde_json::Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Receive the next JSON text frame, skipping WebSocket control frames.
pub async fn recv_json(ws: &mut WsClient) -> serde_json::Value {
    loop {
        let frame = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while waiting for a frame")
            .expect("websocket error while waiting for a frame");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}

/// Assert no JSON frame arrives within `millis`.
pub async fn assert_silent(ws: &mut WsClient, millis: u64) {
    let result = timeout(Duration::from_millis(millis), ws.next()).await;
    if let Ok(Some(Ok(Message::Text(text)))) = result {
        panic!("expected silence, got: {}", text.as_str());
    }
}

/// Drain frames until the server closes the connection.
pub async fn expect_closed(ws: &mut WsClient) {
    loop {
        match timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for close")
        {
            None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
            Some(Ok(_)) => continue,
        }
    }
}

/// Connect expecting a control error frame, and return its code.
pub async fn connect_expecting_error(addr: SocketAddr, token: Option<&str>, url: String) -> String {
    let mut request = url.into_client_request().unwrap();
    if let Some(token) = token {
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
    }
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
    let frame = recv_json(&mut ws).await;
    assert_eq!(frame["type"], "control");
    assert_eq!(frame["event"], "error");
    expect_closed(&mut ws).await;
    frame["error"]["code"].as_str().unwrap().to_string()
}

/// Decode a base64 CRDT payload into plain text via a fresh document.
pub fn decode_state_text(b64: &str) -> String {
    let bytes = collabd::protocol::decode_payload(b64).unwrap();
    let doc = collabd::CollabDocument::new();
    doc.apply_update(&bytes, "test").unwrap();
    doc.to_text()
}

/// Build a base64 sync update that appends `chunk` to a document whose
/// full state is `base_b64`.
pub fn make_insert_update(base_b64: &str, position: u32, chunk: &str) -> String {
    let doc = collabd::CollabDocument::new();
    let bytes = collabd::protocol::decode_payload(base_b64).unwrap();
    if !bytes.is_empty() {
        doc.apply_update(&bytes, "test").unwrap();
    }
    let update = doc.insert(position, chunk);
    collabd::protocol::encode_payload(&update)
}
