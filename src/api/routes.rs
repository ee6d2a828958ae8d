use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::engine::AdServer;

use super::handlers::{
    click_ad, health_check, record_conversion, record_impression, serve_ads, AppState,
};

pub fn create_router(server: Arc<AdServer>) -> Router {
    let state = Arc::new(AppState { server });

    Router::new()
        .route("/health", get(health_check))
        .route("/ads/{placement}", get(serve_ads))
        .route("/ads/impression/{id}", post(record_impression))
        .route("/ads/click/{id}", get(click_ad))
        .route("/ads/conversion/{id}", post(record_conversion))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
