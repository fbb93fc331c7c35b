use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::Json;
use metrics::counter;
use serde_derive::{Deserialize, Serialize};
use tracing::instrument;

use intake_common::funnel::{FunnelKind, FunnelRecord, FunnelSubmission};
use intake_common::states::parse_state_filter;
use intake_common::store::FunnelStore;

use crate::api::{ok, ApiError, ApiResponse};
use crate::auth::AdminAuth;
use crate::router::AppState;

type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Deserialize)]
pub struct StatesQuery {
    pub states: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CountQuery {
    pub states: Option<String>,
    #[serde(default)]
    pub seen: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SeenBody {
    pub seen: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MarkSeenResponse {
    pub matched: u64,
}

fn funnel_kind(kind: &str) -> Result<FunnelKind, ApiError> {
    let kind: FunnelKind = kind.parse()?;
    tracing::Span::current().record("kind", kind.as_str());
    Ok(kind)
}

#[instrument(skip_all, fields(kind, user_session_id))]
pub async fn upsert_funnel(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    payload: Result<Json<FunnelSubmission>, JsonRejection>,
) -> ApiResult<FunnelRecord> {
    let kind = funnel_kind(&kind)?;
    let Json(submission) = payload?;

    let update = submission.into_update(state.timesource.now())?;
    tracing::Span::current().record("user_session_id", update.user_session_id.as_str());

    let record = state.store.upsert_funnel(kind, update).await?;
    counter!("intake_funnel_upserts_total", "kind" => kind.as_str()).increment(1);

    Ok(ok(record))
}

#[instrument(skip_all, fields(kind))]
pub async fn list_funnels(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    query: Result<Query<StatesQuery>, QueryRejection>,
) -> ApiResult<Vec<FunnelRecord>> {
    let kind = funnel_kind(&kind)?;
    let Query(query) = query?;
    let states = parse_state_filter(query.states.as_deref())?;

    Ok(ok(state.store.list_funnels(kind, &states).await?))
}

#[instrument(skip_all, fields(kind))]
pub async fn count_funnels(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    query: Result<Query<CountQuery>, QueryRejection>,
) -> ApiResult<CountResponse> {
    let kind = funnel_kind(&kind)?;
    let Query(query) = query?;
    let states = parse_state_filter(query.states.as_deref())?;

    let count = state.store.count_funnels(kind, &states, query.seen).await?;

    Ok(ok(CountResponse { count }))
}

/// Bulk toggle of `seen` over every record in the state filter. An empty body means
/// `seen: true`; a body that is present must parse, whatever its content type.
#[instrument(skip_all, fields(kind))]
pub async fn mark_seen(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path(kind): Path<String>,
    query: Result<Query<StatesQuery>, QueryRejection>,
    body: Bytes,
) -> ApiResult<MarkSeenResponse> {
    let kind = funnel_kind(&kind)?;
    let Query(query) = query?;
    let states = parse_state_filter(query.states.as_deref())?;
    let seen = if body.iter().all(u8::is_ascii_whitespace) {
        true
    } else {
        let body: SeenBody = serde_json::from_slice(&body)
            .map_err(|e| ApiError::InvalidBody(e.to_string()))?;
        body.seen.unwrap_or(true)
    };

    let matched = state.store.mark_funnels_seen(kind, &states, seen).await?;
    tracing::info!(matched, seen, "marked funnel records");

    Ok(ok(MarkSeenResponse { matched }))
}

#[instrument(skip_all, fields(kind, user_session_id = %session_id))]
pub async fn get_funnel(
    State(state): State<AppState>,
    Path((kind, session_id)): Path<(String, String)>,
) -> ApiResult<FunnelRecord> {
    let kind = funnel_kind(&kind)?;

    match state.store.get_funnel(kind, &session_id).await? {
        Some(record) => Ok(ok(record)),
        None => Err(ApiError::NotFound(format!("funnel record {session_id}"))),
    }
}

#[instrument(skip_all, fields(kind, user_session_id = %session_id))]
pub async fn delete_funnel(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path((kind, session_id)): Path<(String, String)>,
) -> ApiResult<FunnelRecord> {
    let kind = funnel_kind(&kind)?;

    match state.store.delete_funnel(kind, &session_id).await? {
        Some(record) => {
            tracing::info!("deleted funnel record");
            Ok(ok(record))
        }
        None => Err(ApiError::NotFound(format!("funnel record {session_id}"))),
    }
}

#[instrument(skip_all, fields(kind, user_session_id = %session_id))]
pub async fn set_seen(
    State(state): State<AppState>,
    _admin: AdminAuth,
    Path((kind, session_id)): Path<(String, String)>,
    payload: Result<Json<SeenBody>, JsonRejection>,
) -> ApiResult<FunnelRecord> {
    let kind = funnel_kind(&kind)?;
    let Json(body) = payload?;
    let seen = body
        .seen
        .ok_or_else(|| ApiError::InvalidBody("missing field `seen`".to_owned()))?;

    match state.store.set_funnel_seen(kind, &session_id, seen).await? {
        Some(record) => Ok(ok(record)),
        None => Err(ApiError::NotFound(format!("funnel record {session_id}"))),
    }
}
