//! Realtime WebSocket server: accept loop, session lifecycle, sweeps.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room ("records:doc-1") ── CollabDocument ── broadcast
//! Client B ──┘           │                                       │
//!                        │                          ┌────────────┼───────────┐
//!                 SnapshotManager                   ▼            ▼           ▼
//!                 (database | filesystem)        Client A     Client B    Client C
//! ```
//!
//! Every accepted socket runs in its own task: handshake capture, bearer
//! auth, permission check, room join, then a `select!` loop over inbound
//! frames and the room's broadcast channel. Rooms are only ever mutated
//! under their own mutex, so cross-room traffic is fully parallel.
//!
//! Background tasks: a snapshot sweep every `snapshots.interval` seconds
//! and an idle-room cleanup every `rooms.cleanup_timeout` seconds. Both
//! stop on shutdown, after which every room gets one final best-effort
//! snapshot.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::auth::{
    extract_token, parse_room_id, AuthService, AuthUser, ConnectionGateway, Permissions,
    RecordStore,
};
use crate::config::RealtimeConfig;
use crate::error::RealtimeError;
use crate::hooks::{
    HookEmitter, EVENT_CLIENT_CONNECTED, EVENT_CLIENT_DISCONNECTED, EVENT_ROOM_CREATED,
    EVENT_ROOM_DESTROYED, EVENT_SNAPSHOT_SAVED,
};
use crate::manager::{RecordRoomFactory, RoomManager, SharedRoom};
use crate::presence::{color_for_user, PresenceTracker};
use crate::protocol::{
    decode_payload, encode_payload, ClientMessage, RoomStateView, ServerMessage,
};
use crate::room::{ClientConnection, Room, RoomFrame};
use crate::snapshot::SnapshotManager;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server-wide counters, read-mostly.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub updates_applied: u64,
    pub snapshots_saved: u64,
}

/// Everything captured from the HTTP upgrade request.
#[derive(Debug, Clone, Default)]
struct HandshakeInfo {
    path: String,
    query: Option<String>,
    authorization: Option<String>,
    protocols: Vec<String>,
}

/// Per-IP and per-user connection counters. A cap of zero disables the
/// corresponding check.
struct ConnectionLimits {
    per_ip: Mutex<HashMap<IpAddr, u32>>,
    per_user: Mutex<HashMap<String, u32>>,
}

impl ConnectionLimits {
    fn new() -> Self {
        Self {
            per_ip: Mutex::new(HashMap::new()),
            per_user: Mutex::new(HashMap::new()),
        }
    }

    async fn try_acquire_ip(&self, ip: IpAddr, cap: u32) -> bool {
        let mut map = self.per_ip.lock().await;
        let count = map.entry(ip).or_insert(0);
        if cap != 0 && *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    async fn release_ip(&self, ip: IpAddr) {
        let mut map = self.per_ip.lock().await;
        if let Some(count) = map.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(&ip);
            }
        }
    }

    async fn try_acquire_user(&self, user_id: &str, cap: u32) -> bool {
        let mut map = self.per_user.lock().await;
        let count = map.entry(user_id.to_string()).or_insert(0);
        if cap != 0 && *count >= cap {
            return false;
        }
        *count += 1;
        true
    }

    async fn release_user(&self, user_id: &str) {
        let mut map = self.per_user.lock().await;
        if let Some(count) = map.get_mut(user_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(user_id);
            }
        }
    }
}

/// One-second window budget for inbound frames.
struct MessageBudget {
    window: Instant,
    used: u32,
}

impl MessageBudget {
    fn new() -> Self {
        Self { window: Instant::now(), used: 0 }
    }

    fn allow(&mut self, per_second: u32) -> bool {
        if per_second == 0 {
            return true;
        }
        if self.window.elapsed() >= Duration::from_secs(1) {
            self.window = Instant::now();
            self.used = 0;
        }
        if self.used < per_second {
            self.used += 1;
            true
        } else {
            false
        }
    }
}

/// An authenticated, joined connection ready for its message loop. The
/// broadcast receiver travels alongside rather than inside so the message
/// loop can poll it while reading the session.
struct JoinedSession {
    room_id: String,
    room: SharedRoom,
    client_id: Uuid,
    user: AuthUser,
    permissions: Permissions,
    room_state_frame: String,
}

/// The realtime server instance. All shared state lives here; there are
/// no globals.
pub struct RealtimeServer {
    config: RealtimeConfig,
    gateway: ConnectionGateway,
    rooms: RoomManager,
    presence: PresenceTracker,
    snapshots: Arc<SnapshotManager>,
    hooks: HookEmitter,
    limits: ConnectionLimits,
    stats: RwLock<ServerStats>,
    shutdown: watch::Sender<bool>,
}

impl RealtimeServer {
    /// Build a server wired to the host's auth and record backends.
    pub async fn new(
        config: RealtimeConfig,
        auth: Arc<dyn AuthService>,
        records: Arc<dyn RecordStore>,
        hooks: HookEmitter,
    ) -> Arc<Self> {
        let snapshots = Arc::new(SnapshotManager::from_config(&config.snapshots).await);
        let factory = Arc::new(RecordRoomFactory::new(records.clone(), snapshots.clone()));
        let mut rooms = RoomManager::new(config.rooms.max_rooms);
        rooms.register_factory("records", factory.clone());
        rooms.register_factory("record", factory);

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            gateway: ConnectionGateway::new(auth, records),
            rooms,
            presence: PresenceTracker::new(),
            snapshots,
            hooks,
            limits: ConnectionLimits::new(),
            stats: RwLock::new(ServerStats::default()),
            shutdown,
            config,
        })
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self: Arc<Self>) -> std::io::Result<()> {
        if !self.config.enabled {
            log::warn!("Realtime server is disabled by configuration; not starting");
            return Ok(());
        }
        let listener = TcpListener::bind(self.config.bind_addr()).await?;
        log::info!("Realtime server listening on {}", self.config.bind_addr());
        self.serve(listener).await
    }

    /// Serve connections from an already-bound listener.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        self.spawn_background_tasks();
        let mut shutdown_rx = self.shutdown.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                    });
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        log::info!("Realtime server stopped accepting connections");
        Ok(())
    }

    /// Stop the accept loop and sweeps, then final-snapshot every room.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        for (room_id, room) in self.rooms.all_rooms().await {
            let mut guard = room.lock().await;
            self.save_room_snapshot(&room_id, &mut guard).await;
        }
        log::info!("Realtime server shutdown complete");
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    async fn record_sent(&self, bytes: u64) {
        let mut stats = self.stats.write().await;
        stats.messages_sent += 1;
        stats.bytes_sent += bytes;
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        if self.snapshots.is_enabled() {
            let server = self.clone();
            let mut shutdown_rx = self.shutdown.subscribe();
            let period = Duration::from_secs(self.config.snapshots.interval.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => server.snapshot_sweep().await,
                        _ = shutdown_rx.changed() => break,
                    }
                }
            });
        }

        let server = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = Duration::from_secs(self.config.rooms.cleanup_timeout.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => server.cleanup_sweep().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    /// Snapshot every room whose update count or idle time is past the
    /// configured thresholds.
    async fn snapshot_sweep(&self) {
        let max_updates = self.config.snapshots.max_updates;
        let interval = self.config.snapshots.interval;
        for (room_id, room) in self.rooms.all_rooms().await {
            let mut guard = room.lock().await;
            if guard.needs_snapshot(max_updates, interval) {
                self.save_room_snapshot(&room_id, &mut guard).await;
            }
        }
    }

    /// Destroy rooms that have been empty past the cleanup timeout.
    async fn cleanup_sweep(&self) {
        let timeout = self.config.rooms.cleanup_timeout;
        for (room_id, room) in self.rooms.cleanup_empty_rooms(timeout).await {
            {
                let mut guard = room.lock().await;
                self.save_room_snapshot(&room_id, &mut guard).await;
                guard.teardown();
            }
            self.presence.clear_room(&room_id).await;
            self.hooks.emit(EVENT_ROOM_DESTROYED, json!({ "roomId": room_id }));
            log::info!("Destroyed idle room {room_id}");
        }
    }

    /// Persist one room's state if it has pending updates. Best-effort:
    /// failures are logged and the room keeps running memory-only.
    async fn save_room_snapshot(&self, room_id: &str, room: &mut Room) -> bool {
        if !self.snapshots.is_enabled() || room.update_count() == 0 {
            return false;
        }
        let state = room.get_state();
        let snapshot = SnapshotManager::create_snapshot(room_id, state.state, state.version);
        match self.snapshots.save_snapshot(&snapshot).await {
            Ok(()) => {
                room.mark_snapshotted();
                self.stats.write().await.snapshots_saved += 1;
                self.hooks.emit(
                    EVENT_SNAPSHOT_SAVED,
                    json!({ "roomId": room_id, "version": state.version }),
                );
                true
            }
            Err(e) => {
                log::warn!("Snapshot save failed for room {room_id}: {e}");
                false
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let mut handshake: Option<HandshakeInfo> = None;
        let callback = |req: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let protocols: Vec<String> = req
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(',').map(|p| p.trim().to_string()).collect())
                .unwrap_or_default();

            // Echo the token-bearing subprotocol or browsers abort the upgrade.
            if let Some(extracted) = extract_token(None, &protocols, None) {
                if let Some(proto) = &extracted.subprotocol {
                    if let Ok(value) = HeaderValue::from_str(proto) {
                        response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    }
                }
            }

            handshake = Some(HandshakeInfo {
                path: req.uri().path().to_string(),
                query: req.uri().query().map(str::to_string),
                authorization: req
                    .headers()
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string),
                protocols,
            });
            Ok(response)
        };

        let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                log::debug!("WebSocket handshake failed from {addr}: {e}");
                return;
            }
        };
        let info = handshake.unwrap_or_default();

        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }
        log::debug!("WebSocket connection established from {addr}");

        self.serve_client(ws, addr, info).await;

        self.stats.write().await.active_connections -= 1;
    }

    async fn serve_client(
        self: &Arc<Self>,
        ws: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        info: HandshakeInfo,
    ) {
        let (mut ws_tx, mut ws_rx) = ws.split();
        let ip = addr.ip();

        if !self
            .limits
            .try_acquire_ip(ip, self.config.rate_limiting.connections_per_ip)
            .await
        {
            let err = RealtimeError::ConnectionLimitExceeded(
                "too many connections from this address".into(),
            );
            log::warn!("Rejecting {addr}: {err}");
            send_error_and_close(&mut ws_tx, &err).await;
            return;
        }

        // The IP slot is held from here on; release on every exit path.
        let (mut session, mut rx) = match self.establish(&info).await {
            Ok(joined) => joined,
            Err(e) => {
                log::info!("Connection from {addr} rejected: {e}");
                send_error_and_close(&mut ws_tx, &e).await;
                self.limits.release_ip(ip).await;
                return;
            }
        };

        let room_state_frame = std::mem::take(&mut session.room_state_frame);
        let frame_len = room_state_frame.len() as u64;
        if ws_tx.send(Message::Text(room_state_frame.into())).await.is_err() {
            self.finish_session(&session).await;
            self.limits.release_ip(ip).await;
            return;
        }
        self.record_sent(frame_len).await;
        log::info!(
            "User {} joined room {} from {addr}",
            session.user.id,
            session.room_id
        );

        let close_error = self
            .message_loop(&mut ws_tx, &mut ws_rx, &mut rx, &session, addr)
            .await;

        match close_error {
            Some(err) => send_error_and_close(&mut ws_tx, &err).await,
            None => {
                let _ = ws_tx.send(Message::Close(None)).await;
            }
        }

        self.finish_session(&session).await;
        self.limits.release_ip(ip).await;
        log::info!("User {} left room {}", session.user.id, session.room_id);
    }

    /// Parse, authenticate, authorize, and join. Any error here is
    /// terminal and reported to the client before close.
    async fn establish(
        &self,
        info: &HandshakeInfo,
    ) -> Result<(JoinedSession, broadcast::Receiver<Arc<RoomFrame>>), RealtimeError> {
        let (room_type, record_id) = parse_room_id(&info.path, &self.config.path)
            .ok_or_else(|| RealtimeError::Protocol("unrecognized request path".into()))?;

        let token = extract_token(
            info.authorization.as_deref(),
            &info.protocols,
            info.query.as_deref(),
        )
        .ok_or_else(|| RealtimeError::AuthenticationFailed("no bearer token provided".into()))?;

        let user = self.gateway.authenticate(&token).await?;

        if !self
            .limits
            .try_acquire_user(&user.id, self.config.rate_limiting.connections_per_user)
            .await
        {
            return Err(RealtimeError::ConnectionLimitExceeded(
                "too many concurrent connections for this user".into(),
            ));
        }

        match self.join_room(&room_type, &record_id, &user).await {
            Ok(joined) => Ok(joined),
            Err(e) => {
                self.limits.release_user(&user.id).await;
                Err(e)
            }
        }
    }

    async fn join_room(
        &self,
        room_type: &str,
        record_id: &str,
        user: &AuthUser,
    ) -> Result<(JoinedSession, broadcast::Receiver<Arc<RoomFrame>>), RealtimeError> {
        let permissions = self.gateway.authorize(user, record_id).await?;
        let room_id = format!("{room_type}:{record_id}");

        let (room, created) = self.rooms.get_or_create_room(&room_id).await?;
        if created {
            self.hooks.emit(EVENT_ROOM_CREATED, json!({ "roomId": room_id }));
        }

        let client = ClientConnection::new(
            user.id.as_str(),
            user.username.as_str(),
            user.role.as_str(),
            permissions,
            room_id.as_str(),
        );
        let client_id = client.client_id;

        let (rx, state) = {
            let mut guard = room.lock().await;
            let rx = guard.add_client(client);
            (rx, guard.get_state())
        };

        self.presence.join(&room_id, &user.id, &user.username).await;
        let joined_frame = json!({
            "type": "presence",
            "event": "joined",
            "userId": user.id,
            "username": user.username,
            "color": color_for_user(&user.id),
        })
        .to_string();
        room.lock().await.broadcast(RoomFrame { from: client_id, payload: joined_frame });

        self.hooks.emit(
            EVENT_CLIENT_CONNECTED,
            json!({ "roomId": room_id, "userId": user.id }),
        );

        let view = RoomStateView {
            id: state.id,
            participants: state.participants,
            yjs_state: encode_payload(&state.state),
            version: state.version,
        };
        let session = JoinedSession {
            room_id,
            room,
            client_id,
            user: user.clone(),
            permissions,
            room_state_frame: ServerMessage::room_state(view).to_json(),
        };
        Ok((session, rx))
    }

    /// The per-connection event loop. Returns the terminal error to report
    /// before close, or `None` for a clean disconnect.
    async fn message_loop(
        &self,
        ws_tx: &mut WsSink,
        ws_rx: &mut WsSource,
        rx: &mut broadcast::Receiver<Arc<RoomFrame>>,
        session: &JoinedSession,
        addr: SocketAddr,
    ) -> Option<RealtimeError> {
        let mut budget = MessageBudget::new();
        let mut shutdown_rx = self.shutdown.subscribe();
        let per_second = self.config.rate_limiting.messages_per_second;

        loop {
            tokio::select! {
                inbound = ws_rx.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut stats = self.stats.write().await;
                                stats.messages_received += 1;
                                stats.bytes_received += text.len() as u64;
                            }
                            if !budget.allow(per_second) {
                                log::warn!(
                                    "Rate limit exceeded by user {} from {addr}; dropping frame",
                                    session.user.id
                                );
                                continue;
                            }
                            let msg = match ClientMessage::from_json(text.as_str()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    log::warn!("Dropping malformed frame from {addr}: {e}");
                                    continue;
                                }
                            };
                            if let Some(err) =
                                self.handle_client_message(ws_tx, session, msg, text.as_str()).await
                            {
                                if err.is_terminal() {
                                    return Some(err);
                                }
                                log::warn!(
                                    "Dropping bad frame from user {} in room {}: {err}",
                                    session.user.id,
                                    session.room_id
                                );
                                let frame = ServerMessage::error(&err).to_json();
                                if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                                    return None;
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            log::warn!("Ignoring binary frame from {addr}; protocol is JSON text");
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_tx.send(Message::Pong(payload)).await.is_err() {
                                return None;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => return None,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            log::debug!("WebSocket error from {addr}: {e}");
                            return None;
                        }
                    }
                }
                frame = rx.recv() => {
                    match frame {
                        Ok(frame) => {
                            if frame.from == session.client_id {
                                continue;
                            }
                            let payload = frame.payload.clone();
                            let frame_len = payload.len() as u64;
                            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                                return None;
                            }
                            self.record_sent(frame_len).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            log::warn!(
                                "Client {} in room {} lagged; {skipped} frames dropped",
                                session.client_id,
                                session.room_id
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
                _ = shutdown_rx.changed() => return None,
            }
        }
    }

    /// Dispatch one parsed client message. Returns an error to report;
    /// terminal errors close the connection.
    async fn handle_client_message(
        &self,
        ws_tx: &mut WsSink,
        session: &JoinedSession,
        msg: ClientMessage,
        raw: &str,
    ) -> Option<RealtimeError> {
        match msg {
            ClientMessage::Ping => {
                let frame = ServerMessage::pong().to_json();
                let frame_len = frame.len() as u64;
                if ws_tx.send(Message::Text(frame.into())).await.is_ok() {
                    self.record_sent(frame_len).await;
                }
                None
            }
            ClientMessage::Sync { update } => {
                if !session.permissions.can_edit {
                    return Some(RealtimeError::permission_denied(
                        "read-only access to this record",
                    ));
                }
                let bytes = match decode_payload(&update) {
                    Ok(bytes) => bytes,
                    Err(e) => return Some(e),
                };
                let version = {
                    let mut room = session.room.lock().await;
                    match room.apply_remote_update(&bytes, session.client_id) {
                        Ok(version) => version,
                        Err(e) => return Some(e),
                    }
                };
                self.stats.write().await.updates_applied += 1;
                let frame = ServerMessage::sync(&bytes, version, session.user.id.as_str());
                session.room.lock().await.broadcast(RoomFrame {
                    from: session.client_id,
                    payload: frame.to_json(),
                });
                None
            }
            ClientMessage::Presence { event, data } => {
                self.presence
                    .apply(&session.room_id, &session.user.id, event, &data)
                    .await;
                // Peers get the frame exactly as the client sent it.
                session.room.lock().await.broadcast(RoomFrame {
                    from: session.client_id,
                    payload: raw.to_string(),
                });
                None
            }
        }
    }

    /// Leave the room, retract presence, snapshot if the room emptied, and
    /// release the per-user slot.
    async fn finish_session(&self, session: &JoinedSession) {
        let (room_emptied, user_still_present) = {
            let mut room = session.room.lock().await;
            room.remove_client(&session.client_id);
            let emptied = room.client_count() == 0;
            if emptied {
                self.save_room_snapshot(&session.room_id, &mut room).await;
            }
            let still_present = !emptied && room.has_user(&session.user.id);
            (emptied, still_present)
        };

        // Only the user's last socket in the room retracts their presence.
        if !user_still_present {
            self.presence.leave(&session.room_id, &session.user.id).await;
            if !room_emptied {
                let left_frame = json!({
                    "type": "presence",
                    "event": "left",
                    "userId": session.user.id,
                })
                .to_string();
                session.room.lock().await.broadcast(RoomFrame {
                    from: session.client_id,
                    payload: left_frame,
                });
            }
        }

        self.hooks.emit(
            EVENT_CLIENT_DISCONNECTED,
            json!({ "roomId": session.room_id, "userId": session.user.id }),
        );
        self.limits.release_user(&session.user.id).await;
    }
}

async fn send_error_and_close(ws_tx: &mut WsSink, err: &RealtimeError) {
    let frame = ServerMessage::error(err).to_json();
    let _ = ws_tx.send(Message::Text(frame.into())).await;
    let _ = ws_tx.send(Message::Close(None)).await;
}
