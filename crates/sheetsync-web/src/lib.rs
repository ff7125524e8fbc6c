//! Axum transport for sheetsync: websocket event protocol plus augmentation endpoints.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path as AxumPath, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use sheetsync_augment::{
    AugmentationError, AugmentationProvider, CellEdit, InMemoryAugmentationStore, PgAugmentationStore,
};
use sheetsync_core::{ClientEvent, ResourceId, ServerEvent, UserId};
use sheetsync_hub::{ChannelClient, ClientHandle, HubConfig, SyncHub};
use sheetsync_storage::{CachingFetcher, SheetsApiUpstream, UpstreamConfig};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const USER_HEADER: &str = "x-user-id";

#[derive(Clone)]
pub struct AppState {
    pub hub: SyncHub,
    pub augmentation: Arc<dyn AugmentationProvider>,
}

impl AppState {
    pub fn new(hub: SyncHub, augmentation: Arc<dyn AugmentationProvider>) -> Self {
        Self { hub, augmentation }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewColumnBody {
    #[serde(default)]
    name: String,
    #[serde(default)]
    data_type: String,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/ws", get(ws_handler))
        .route(
            "/api/resources/{resource_id}/columns",
            get(list_columns_handler).post(add_column_handler),
        )
        .route(
            "/api/resources/{resource_id}/values",
            get(list_values_handler).post(save_value_handler),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

fn cors_layer(client_url: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::HeaderName::from_static(USER_HEADER)]);
    match client_url.and_then(|url| HeaderValue::from_str(url).ok()) {
        Some(origin) => {
            info!(origin = ?origin, "CORS restricted to client origin");
            cors.allow_origin(origin).allow_credentials(true)
        }
        None => cors.allow_origin(Any),
    }
}

/// Build the hub and providers from the environment and serve until shutdown.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("SHEETSYNC_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let client_url = std::env::var("CLIENT_URL").ok().filter(|v| !v.is_empty());

    let augmentation: Arc<dyn AugmentationProvider> = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let store = PgAugmentationStore::connect(&url).await?;
            store.migrate().await?;
            info!("augmentation store: postgres");
            Arc::new(store)
        }
        _ => {
            warn!("DATABASE_URL not set; augmentation columns are kept in memory");
            Arc::new(InMemoryAugmentationStore::new())
        }
    };

    let upstream_config = UpstreamConfig::from_env();
    let fetcher = Arc::new(CachingFetcher::new(
        SheetsApiUpstream::new(&upstream_config)?,
        upstream_config.snapshot_ttl,
    ));
    let hub = SyncHub::new(fetcher, augmentation.clone(), HubConfig::from_env());

    let router = app(AppState::new(hub, augmentation)).layer(cors_layer(client_url.as_deref()));
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "sheetsync listening");
    axum::serve(listener, router).await?;
    Ok(())
}

async fn index_handler() -> &'static str {
    "sheetsync is running"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

/// Runs for the lifetime of one websocket connection.
async fn handle_socket(socket: WebSocket, hub: SyncHub) {
    let (client, mut outbox) = ChannelClient::new(hub.config().client_buffer);
    let client_id = client.id();
    let client: Arc<dyn ClientHandle> = Arc::new(client);
    info!(client_id = %client_id, "websocket connected");

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            if let Err(e) = send_event(&mut sender, &event).await {
                debug!(client_id = %client_id, error = %e, "websocket send failed");
                break;
            }
        }
    });

    let recv_hub = hub.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => dispatch(&recv_hub, &client, text.as_str()).await,
                Ok(Message::Close(_)) => {
                    debug!(client_id = %client_id, "client sent close frame");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(client_id = %client_id, error = %e, "websocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    hub.disconnect(client_id).await;
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = event.to_json().map_err(|e| {
        error!(error = %e, "failed to serialize event");
        axum::Error::new(e)
    })?;
    sender.send(Message::Text(json.into())).await
}

/// Apply one client frame to the hub.
///
/// Malformed frames are answered with an `error` event and otherwise ignored.
pub async fn dispatch(hub: &SyncHub, client: &Arc<dyn ClientHandle>, text: &str) {
    match ClientEvent::parse(text) {
        Ok(ClientEvent::Subscribe { resource_id, user_id }) => {
            if resource_id.is_empty() {
                debug!(client_id = %client.id(), "subscribe without resource id ignored");
                return;
            }
            // Initial fetch failures have already been reported to the client.
            if let Err(err) = hub.subscribe(resource_id, client.clone(), user_id).await {
                debug!(client_id = %client.id(), error = %err, "subscribe failed");
            }
        }
        Ok(ClientEvent::Unsubscribe { resource_id }) => {
            hub.unsubscribe(&resource_id, client.id()).await;
        }
        Err(err) => {
            warn!(client_id = %client.id(), error = %err, "malformed client frame");
            if client.send(ServerEvent::error(format!("Malformed message: {err}"))).is_err() {
                debug!(client_id = %client.id(), "client gone before error delivery");
            }
        }
    }
}

fn require_user(headers: &HeaderMap) -> Result<UserId, Response> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(UserId::from)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "success": false, "message": "Unauthorized" })),
            )
                .into_response()
        })
}

fn augmentation_error(err: AugmentationError) -> Response {
    match err {
        AugmentationError::Validation(err) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": err.to_string() })),
        )
            .into_response(),
        other => {
            error!(error = %other, "augmentation request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": "Internal server error" })),
            )
                .into_response()
        }
    }
}

async fn list_columns_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(resource_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    match state
        .augmentation
        .list_columns(&ResourceId::from(resource_id), &user_id)
        .await
    {
        Ok(columns) => Json(json!({ "success": true, "columns": columns })).into_response(),
        Err(err) => augmentation_error(err),
    }
}

async fn add_column_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(resource_id): AxumPath<String>,
    headers: HeaderMap,
    Json(body): Json<NewColumnBody>,
) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    let resource_id = ResourceId::from(resource_id);
    match state
        .augmentation
        .add_column(&resource_id, &user_id, &body.name, &body.data_type)
        .await
    {
        Ok(column) => {
            info!(resource_id = %resource_id, user_id = %user_id, column_id = %column.id, "augmentation column added");
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "column": column })),
            )
                .into_response()
        }
        Err(err) => augmentation_error(err),
    }
}

async fn list_values_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(resource_id): AxumPath<String>,
    headers: HeaderMap,
) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    match state
        .augmentation
        .list_values(&ResourceId::from(resource_id), &user_id)
        .await
    {
        Ok(data) => Json(json!({ "success": true, "data": data })).into_response(),
        Err(err) => augmentation_error(err),
    }
}

async fn save_value_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(resource_id): AxumPath<String>,
    headers: HeaderMap,
    Json(edit): Json<CellEdit>,
) -> Response {
    let user_id = match require_user(&headers) {
        Ok(user_id) => user_id,
        Err(resp) => return resp,
    };
    match state
        .augmentation
        .save_value(&ResourceId::from(resource_id), &user_id, &edit)
        .await
    {
        Ok(()) => Json(json!({ "success": true, "message": "Data saved successfully" })).into_response(),
        Err(err) => augmentation_error(err),
    }
}
