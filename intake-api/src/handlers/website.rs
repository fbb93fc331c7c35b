use axum::extract::State;
use axum::Json;
use metrics::counter;
use serde_json::{Map, Value};
use tracing::instrument;

use intake_common::store::{ContentStore, StoreError};

use crate::api::{ok, ApiError, ApiResponse};
use crate::router::AppState;

/// The active document of every content collection, keyed by collection name.
/// Served from a TTL cache that admin content writes invalidate.
#[instrument(skip_all)]
pub async fn website_data(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<Value>>, ApiError> {
    let store = state.store.clone();
    let (data, source) = state
        .website_data
        .get_or_load(|| async move {
            let documents = store.list_active_content().await?;
            let data: Map<String, Value> = documents
                .into_iter()
                .map(|document| (document.collection, document.body))
                .collect();
            Ok::<_, StoreError>(Value::Object(data))
        })
        .await?;

    counter!("intake_website_data_cache_total", "outcome" => source.as_str()).increment(1);
    tracing::debug!(source = source.as_str(), "served website data");

    Ok(ok(data))
}
