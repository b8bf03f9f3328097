use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use axum_extra::TypedHeader;
use chrono::Utc;
use headers::{authorization::Bearer, Authorization};
use serde_json::{json, Value};
use uuid::Uuid;

use shared_config::AppConfig;
use shared_models::auth::User;
use shared_models::error::AppError;

use crate::access::TissContext;
use crate::models::{
    CreateBatchRequest, CreateGuideRequest, CreateReturnRequest, GlosaListQuery, GuideListQuery,
    RunMonthlyBatchingRequest,
};
use crate::services::{BatchService, GuideService, ReturnProcessingService, XmlExportService};

fn parse_id(raw: &str, what: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(raw).map_err(|_| AppError::BadRequest(format!("Identificador de {} inválido", what)))
}

fn success(data: impl serde::Serialize) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": data
    }))
}

// ==============================================================================
// GUIDES
// ==============================================================================

#[axum::debug_handler]
pub async fn create_guide(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateGuideRequest>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let service = GuideService::new(&state);

    let guide = service.create_guide(&ctx, request, auth.token()).await?;
    Ok(success(guide))
}

#[axum::debug_handler]
pub async fn list_guides(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(query): Query<GuideListQuery>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let service = GuideService::new(&state);

    let page = service.list_guides(&ctx, query, auth.token()).await?;
    Ok(success(page))
}

#[axum::debug_handler]
pub async fn get_guide(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(guide_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let guide_id = parse_id(&guide_id, "guia")?;
    let service = GuideService::new(&state);

    let guide = service.get_guide(&ctx, guide_id, auth.token()).await?;
    Ok(success(guide))
}

// ==============================================================================
// BATCHES
// ==============================================================================

#[axum::debug_handler]
pub async fn create_batch(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateBatchRequest>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let service = BatchService::new(&state);

    let batch = service.create_batch_from_guides(&ctx, request, auth.token()).await?;
    Ok(success(batch))
}

/// Runs the monthly job on demand for the caller's clinic; the report is
/// returned even when units failed.
#[axum::debug_handler]
pub async fn run_monthly_batching(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(request): Query<RunMonthlyBatchingRequest>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    ctx.require_admin()?;

    // Same key as the scheduled run, scoped to the caller's clinic
    let token = if state.supabase_service_role_key.is_empty() {
        auth.token().to_string()
    } else {
        state.supabase_service_role_key.clone()
    };

    let reference_date = request.reference_date.unwrap_or_else(|| Utc::now().date_naive());
    let service = BatchService::new(&state);
    let report = service
        .run_monthly_batching(reference_date, Some(ctx.clinic_id), &token)
        .await;

    Ok(success(report))
}

#[axum::debug_handler]
pub async fn get_batch(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(batch_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let batch_id = parse_id(&batch_id, "lote")?;
    let service = BatchService::new(&state);

    let batch = service.get_batch(&ctx, batch_id, auth.token()).await?;
    Ok(success(batch))
}

#[axum::debug_handler]
pub async fn recalculate_batch(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(batch_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let batch_id = parse_id(&batch_id, "lote")?;
    let service = BatchService::new(&state);

    let batch = service.recalculate_totals(&ctx, batch_id, auth.token()).await?;
    Ok(success(batch))
}

#[axum::debug_handler]
pub async fn submit_batch(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(batch_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let batch_id = parse_id(&batch_id, "lote")?;
    let service = BatchService::new(&state);

    let batch = service.submit_batch(&ctx, batch_id, auth.token()).await?;
    Ok(success(batch))
}

#[axum::debug_handler]
pub async fn generate_batch_xml(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(batch_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let batch_id = parse_id(&batch_id, "lote")?;
    let service = XmlExportService::new(&state);

    let result = service.generate_for_batch(&ctx, batch_id, auth.token()).await?;
    Ok(success(result))
}

/// Redirects to the stored XML artifact.
#[axum::debug_handler]
pub async fn download_batch_xml(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(batch_id): Path<String>,
) -> Result<Response, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let batch_id = parse_id(&batch_id, "lote")?;
    let service = XmlExportService::new(&state);

    let url = service.stored_xml_url(&ctx, batch_id, auth.token()).await?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]).into_response())
}

// ==============================================================================
// RETURNS & GLOSAS
// ==============================================================================

#[axum::debug_handler]
pub async fn register_return(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Json(request): Json<CreateReturnRequest>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let service = ReturnProcessingService::new(&state);

    let tiss_return = service.register_return(&ctx, request, auth.token()).await?;
    Ok(success(tiss_return))
}

#[axum::debug_handler]
pub async fn process_return(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Path(return_id): Path<String>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let return_id = parse_id(&return_id, "retorno")?;
    let service = ReturnProcessingService::new(&state);

    let summary = service.process_return(&ctx, return_id, auth.token()).await?;
    Ok(success(summary))
}

#[axum::debug_handler]
pub async fn list_glosas(
    State(state): State<Arc<AppConfig>>,
    TypedHeader(auth): TypedHeader<Authorization<Bearer>>,
    Extension(user): Extension<User>,
    Query(query): Query<GlosaListQuery>,
) -> Result<Json<Value>, AppError> {
    let ctx = TissContext::from_user(&user)?;
    let service = ReturnProcessingService::new(&state);

    let glosas = service.list_glosas(&ctx, query, auth.token()).await?;
    Ok(success(json!({
        "glosas": glosas,
        "total": glosas.len()
    })))
}
