use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::monitoring::coordinator::CheckCoordinator;

pub mod error;
pub mod heartbeat;

pub use error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<CheckCoordinator>,
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_axum_router(coordinator: Arc<CheckCoordinator>) -> Router {
    let app_state = Arc::new(AppState { coordinator });

    Router::new()
        .route("/health", get(health_check_handler))
        .merge(heartbeat::heartbeat_router())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}
