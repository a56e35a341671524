//! collab-relay: topic relay and row store for collaborative sessions
//!
//! - `/ws` multiplexes topic subscriptions over one binary websocket
//! - `/api/rows` exposes the sled row store to `HttpRowStore` clients
//! - Delivery order per topic is the order the relay received publishes in

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::{net::SocketAddr, sync::Arc};
use tokio_stream::{wrappers::UnboundedReceiverStream, StreamExt, StreamMap};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use collab_session::storage::{RowBody, RowList, RowStore, SledRowStore, StorageConfig, StoreError};
use collab_session::transport::{
    protocol::{ClientFrame, ErrorCode, FrameProtocol, ServerFrame, PROTOCOL_VERSION},
    Notification, TopicHub,
};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone)]
struct RelayConfig {
    port: u16,
    storage: StorageConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            storage: StorageConfig::default(),
        }
    }
}

impl RelayConfig {
    /// `PORT` and `STORAGE_PATH`
    fn from_env() -> Self {
        let mut config = Self {
            storage: StorageConfig::from_env(),
            ..Default::default()
        };
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
    }
}

// ============================================================================
// APPLICATION STATE
// ============================================================================

struct AppState {
    hub: Arc<TopicHub>,
    rows: SledRowStore,
    started_at: std::time::Instant,
}

// ============================================================================
// API TYPES
// ============================================================================

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    protocol_version: u8,
    uptime_seconds: u64,
    active_topics: usize,
    stored_rows: usize,
}

#[derive(Debug, Deserialize)]
struct PrefixQuery {
    prefix: Option<String>,
}

/// Row store failure as an HTTP response
struct ApiError(StatusCode, String);

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        let status = match err {
            StoreError::UnknownTable(_) => StatusCode::NOT_FOUND,
            StoreError::Corruption(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, self.1).into_response()
    }
}

// ============================================================================
// HTTP HANDLERS
// ============================================================================

async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        protocol_version: PROTOCOL_VERSION,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        active_topics: state.hub.topic_count(),
        stored_rows: state.rows.stats().row_count,
    })
}

async fn list_rows(
    State(state): State<Arc<AppState>>,
    Path(table): Path<String>,
    Query(query): Query<PrefixQuery>,
) -> Result<Json<RowList>, ApiError> {
    let prefix = query.prefix.unwrap_or_default();
    let rows = state
        .rows
        .select_prefix(&table, &prefix)
        .await?
        .into_iter()
        .map(|(key, value)| RowBody::encode(key, &value))
        .collect();
    Ok(Json(RowList { rows }))
}

async fn get_row(
    State(state): State<Arc<AppState>>,
    Path((table, key)): Path<(String, String)>,
) -> Result<Json<RowBody>, ApiError> {
    match state.rows.select(&table, &key).await? {
        Some(value) => Ok(Json(RowBody::encode(key, &value))),
        None => Err(ApiError(StatusCode::NOT_FOUND, format!("No row {} in {}", key, table))),
    }
}

async fn put_row(
    State(state): State<Arc<AppState>>,
    Path((table, key)): Path<(String, String)>,
    Json(row): Json<RowBody>,
) -> Result<StatusCode, ApiError> {
    if row.key != key {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            format!("Row key {} does not match path key {}", row.key, key),
        ));
    }
    let value = row.decode()?;
    state.rows.upsert(&table, &key, value).await?;
    debug!("Stored row {} in {}", key, table);
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_row(
    State(state): State<Arc<AppState>>,
    Path((table, key)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.rows.select(&table, &key).await?.is_none() {
        return Ok(StatusCode::NOT_FOUND);
    }
    state.rows.delete(&table, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// WEBSOCKET HANDLER
// ============================================================================

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    match FrameProtocol::encode_server(frame) {
        Ok(bytes) => socket.send(Message::Binary(bytes.to_vec())).await.is_ok(),
        Err(e) => {
            warn!("Failed to encode frame: {}", e);
            true
        }
    }
}

/// Wait for the client's hello; returns its client id
async fn handshake(socket: &mut WebSocket) -> Option<String> {
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Binary(data) = msg else {
            continue;
        };
        match FrameProtocol::decode_client(&data) {
            Ok(ClientFrame::Hello {
                protocol_version,
                client_id,
            }) if protocol_version == PROTOCOL_VERSION => {
                let welcome = ServerFrame::Welcome {
                    protocol_version: PROTOCOL_VERSION,
                    client_id: client_id.clone(),
                    server_time: chrono::Utc::now().timestamp(),
                };
                return send_frame(socket, &welcome).await.then_some(client_id);
            }
            Ok(ClientFrame::Hello {
                protocol_version, ..
            }) => {
                let error = FrameProtocol::error_response(
                    ErrorCode::VersionMismatch,
                    format!("Expected protocol {}, got {}", PROTOCOL_VERSION, protocol_version),
                );
                send_frame(socket, &error).await;
                return None;
            }
            Ok(other) => debug!("Ignoring frame before hello: {:?}", other),
            Err(e) => {
                let error = FrameProtocol::error_response(ErrorCode::InvalidMessage, e.to_string());
                send_frame(socket, &error).await;
                return None;
            }
        }
    }
    None
}

async fn handle_websocket(mut socket: WebSocket, state: Arc<AppState>) {
    let Some(client_id) = handshake(&mut socket).await else {
        debug!("Connection closed before handshake");
        return;
    };
    info!("Client {} connected", client_id);

    let mut deliveries: StreamMap<String, UnboundedReceiverStream<Notification>> = StreamMap::new();
    let mut subscriptions: HashMap<String, u64> = HashMap::new();

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let data = match incoming {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let frame = match FrameProtocol::decode_client(&data) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("Failed to decode frame from {}: {}", client_id, e);
                        let error =
                            FrameProtocol::error_response(ErrorCode::InvalidMessage, e.to_string());
                        if !send_frame(&mut socket, &error).await {
                            break;
                        }
                        continue;
                    }
                };
                match frame {
                    ClientFrame::Subscribe { topic } => {
                        if subscriptions.contains_key(&topic) {
                            continue;
                        }
                        let (id, rx) = state.hub.subscribe(&topic);
                        subscriptions.insert(topic.clone(), id);
                        deliveries.insert(topic, UnboundedReceiverStream::new(rx));
                    }
                    ClientFrame::Unsubscribe { topic } => {
                        if let Some(id) = subscriptions.remove(&topic) {
                            state.hub.unsubscribe(&topic, id);
                            deliveries.remove(&topic);
                        } else {
                            let error = FrameProtocol::error_response(
                                ErrorCode::NotSubscribed,
                                format!("Not subscribed to {}", topic),
                            );
                            if !send_frame(&mut socket, &error).await {
                                break;
                            }
                        }
                    }
                    ClientFrame::Publish { topic, event } => {
                        let reached = state.hub.publish(Notification {
                            topic,
                            origin_id: client_id.clone(),
                            event,
                        });
                        debug!("Relayed publish from {} to {} subscribers", client_id, reached);
                    }
                    ClientFrame::Ping { timestamp } => {
                        let pong = ServerFrame::Pong {
                            timestamp,
                            server_time: chrono::Utc::now().timestamp(),
                        };
                        if !send_frame(&mut socket, &pong).await {
                            break;
                        }
                    }
                    ClientFrame::Hello { .. } => debug!("Duplicate hello from {}", client_id),
                }
            }
            Some((_, notification)) = deliveries.next(), if !deliveries.is_empty() => {
                if !send_frame(&mut socket, &ServerFrame::Deliver(notification)).await {
                    break;
                }
            }
        }
    }

    for (topic, id) in subscriptions {
        state.hub.unsubscribe(&topic, id);
    }
    info!("Client {} disconnected", client_id);
}

fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(ws_handler))
        .route("/api/rows/:table", get(list_rows))
        .route("/api/rows/:table/:key", get(get_row).put(put_row).delete(delete_row))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
}

// ============================================================================
// MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_session=info,collab_relay=info,tower_http=info".into()),
        )
        .init();

    dotenvy::dotenv().ok();
    let config = RelayConfig::from_env();

    info!("Initializing storage at: {}", config.storage.path);
    let rows = SledRowStore::open(config.storage.clone())?;

    let state = Arc::new(AppState {
        hub: Arc::new(TopicHub::new()),
        rows,
        started_at: std::time::Instant::now(),
    });

    let app = router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));

    info!("collab-relay v{} starting", env!("CARGO_PKG_VERSION"));
    info!("   Protocol version: {}", PROTOCOL_VERSION);
    info!("   WebSocket: ws://{}/ws", addr);
    info!("   Rows: http://{}/api/rows/:table", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
