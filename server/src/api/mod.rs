use axum::extract::State;
use axum::http::{header, Method};
use axum::{
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::cache::HotDeviceCache;
use crate::config::AppConfig;
use crate::db::Database;
use crate::evaluators::{MotionEvaluator, OverspeedEvaluator, StateEvaluator};
use crate::groups::GroupManager;
use crate::hub::Hub;
use crate::notifications::EventRecorder;
use crate::session::ConnectionManager;
use crate::storage::{DeviceCache, DeviceStore, PositionStore};

pub mod devices;
pub mod error;
pub mod groups;
pub mod ws;

pub use error::AppError;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub devices: Arc<dyn DeviceStore>,
    pub positions: Arc<dyn PositionStore>,
    pub manager: Arc<ConnectionManager>,
    pub hub: Arc<Hub>,
    pub groups: Arc<GroupManager>,
    pub cache: Arc<dyn DeviceCache>,
    pub evaluators: Vec<Arc<dyn StateEvaluator>>,
}

impl AppState {
    /// Wire up the full session core on top of one database handle.
    pub fn new(database: Arc<Database>, config: AppConfig) -> Self {
        let cache: Arc<dyn DeviceCache> = Arc::new(HotDeviceCache::new());
        let hub = Hub::new(database.clone());
        let notifications = Arc::new(EventRecorder::new(
            database.clone(),
            database.clone(),
            hub.clone(),
        ));
        let evaluators: Vec<Arc<dyn StateEvaluator>> = vec![
            Arc::new(MotionEvaluator::new()),
            Arc::new(OverspeedEvaluator::new(0.0)),
        ];
        let manager = ConnectionManager::new(
            database.clone(),
            notifications,
            cache.clone(),
            hub.clone(),
            evaluators.clone(),
            &config,
        );
        let groups = Arc::new(GroupManager::new(database.clone()));

        Self {
            config,
            devices: database.clone(),
            positions: database,
            manager,
            hub,
            groups,
            cache,
            evaluators,
        }
    }
}

/// Build the main application router with all API routes.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::mirror_request())
        .allow_methods([Method::GET, Method::POST, Method::PATCH])
        .allow_headers([header::CONTENT_TYPE]);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/server/stats", get(stats))
        // Devices
        .route("/devices", get(devices::list))
        .route("/devices/:id", get(devices::get_one))
        .route("/devices/:id/session", get(devices::session))
        .route("/devices/:id/position", get(devices::position))
        // Groups
        .route("/groups", get(groups::list))
        .route("/groups", post(groups::create))
        .route("/groups/:id", patch(groups::update))
        // WebSocket for live updates
        .route("/ws", get(ws::ws_handler));

    Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .with_state(state)
}

/// Simple health check endpoint.
async fn health() -> &'static str {
    "ok"
}

/// Live counters: sessions, hot devices, registered listeners.
async fn stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "active_sessions": state.manager.session_count(),
        "hot_devices": state.cache.len(),
        "listeners": state.hub.listener_count(),
    }))
}
