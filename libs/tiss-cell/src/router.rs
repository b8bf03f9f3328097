use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use shared_config::AppConfig;
use shared_utils::extractor::auth_middleware;

use crate::handlers;

pub fn tiss_routes(state: Arc<AppConfig>) -> Router {
    Router::new()
        // Guides
        .route("/guides", get(handlers::list_guides).post(handlers::create_guide))
        .route("/guides/{guide_id}", get(handlers::get_guide))

        // Batches
        .route("/batches", post(handlers::create_batch))
        .route("/batches/run-monthly", post(handlers::run_monthly_batching))
        .route("/batches/{batch_id}", get(handlers::get_batch))
        .route("/batches/{batch_id}/recalculate", post(handlers::recalculate_batch))
        .route("/batches/{batch_id}/submit", post(handlers::submit_batch))
        .route(
            "/batches/{batch_id}/generate-xml",
            post(handlers::generate_batch_xml).get(handlers::download_batch_xml),
        )

        // Insurer returns
        .route("/returns", post(handlers::register_return))
        .route("/returns/{return_id}/parse", post(handlers::process_return))
        .route("/glosas", get(handlers::list_glosas))

        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}
