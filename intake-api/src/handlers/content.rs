use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use intake_common::content::{Collection, ContentDocument, NewContent};
use intake_common::store::ContentStore;

use crate::api::{created, ok, ApiError, ApiResponse};
use crate::auth::AdminAuth;
use crate::router::AppState;

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct UpdateContent {
    pub body: Value,
}

fn document_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::NotFound(format!("content document {id}")))
}

fn not_found(id: Uuid) -> ApiError {
    ApiError::NotFound(format!("content document {id}"))
}

#[instrument(skip_all, fields(collection = %collection))]
pub async fn list_content(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<Vec<ContentDocument>> {
    let collection: Collection = collection.parse()?;

    Ok(ok(state.store.list_content(&collection).await?))
}

#[instrument(skip_all, fields(collection = %collection))]
pub async fn active_content(
    State(state): State<AppState>,
    Path(collection): Path<String>,
) -> ApiResult<ContentDocument> {
    let collection: Collection = collection.parse()?;

    match state.store.get_active_content(&collection).await? {
        Some(document) => Ok(ok(document)),
        None => Err(ApiError::NotFound(format!("active {collection} document"))),
    }
}

#[instrument(skip_all, fields(collection = %collection))]
pub async fn create_content(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(collection): Path<String>,
    payload: Result<Json<NewContent>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<ContentDocument>>), ApiError> {
    let collection: Collection = collection.parse()?;
    let Json(content) = payload?;

    let document = state.store.create_content(&collection, content).await?;
    state.website_data.invalidate().await;
    tracing::info!(id = %document.id, active = document.is_active, "created content document");

    Ok(created(document))
}

#[instrument(skip_all, fields(collection = %collection, id = %id))]
pub async fn update_content(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path((collection, id)): Path<(String, String)>,
    payload: Result<Json<UpdateContent>, JsonRejection>,
) -> ApiResult<ContentDocument> {
    let collection: Collection = collection.parse()?;
    let id = document_id(&id)?;
    let Json(update) = payload?;

    let document = state
        .store
        .update_content_body(&collection, id, update.body)
        .await?
        .ok_or_else(|| not_found(id))?;
    state.website_data.invalidate().await;

    Ok(ok(document))
}

/// Make one document the collection's active one, deactivating whichever was active before.
#[instrument(skip_all, fields(collection = %collection, id = %id))]
pub async fn activate_content(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<ContentDocument> {
    let collection: Collection = collection.parse()?;
    let id = document_id(&id)?;

    let document = state
        .store
        .activate_content(&collection, id)
        .await?
        .ok_or_else(|| not_found(id))?;
    state.website_data.invalidate().await;
    tracing::info!("activated content document");

    Ok(ok(document))
}

#[instrument(skip_all, fields(collection = %collection, id = %id))]
pub async fn delete_content(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path((collection, id)): Path<(String, String)>,
) -> ApiResult<ContentDocument> {
    let collection: Collection = collection.parse()?;
    let id = document_id(&id)?;

    let document = state
        .store
        .delete_content(&collection, id)
        .await?
        .ok_or_else(|| not_found(id))?;
    state.website_data.invalidate().await;

    Ok(ok(document))
}
