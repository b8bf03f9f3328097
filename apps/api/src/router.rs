use std::sync::Arc;

use axum::{
    Router,
    routing::get,
};

use shared_config::AppConfig;
use tiss_cell::tiss_routes;

pub fn create_router(state: Arc<AppConfig>) -> Router {
    Router::new()
        .route("/", get(|| async { "TISS billing API is running!" }))
        .nest("/tiss", tiss_routes(state))
}
