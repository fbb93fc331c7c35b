use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, patch, post, put},
    Router,
};
use serde_json::Value;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::trace::TraceLayer;

use intake_common::cache::TtlCache;
use intake_common::metrics::track_metrics;
use intake_common::store::Store;
use intake_common::time::TimeSource;

use crate::handlers::{app, content, funnel, submission, website};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub website_data: Arc<TtlCache<Value>>,
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
        website_data_ttl: Duration,
        admin_token: Option<String>,
    ) -> Self {
        Self {
            store,
            website_data: Arc::new(TtlCache::new(website_data_ttl, timesource.clone())),
            timesource,
            admin_token: admin_token.map(Arc::from),
        }
    }
}

pub fn router(state: AppState, max_body_size: usize, concurrency_limit: usize) -> Router {
    let api = Router::new()
        .route(
            "/api/funnels/:kind",
            get(funnel::list_funnels).post(funnel::upsert_funnel),
        )
        .route("/api/funnels/:kind/count", get(funnel::count_funnels))
        .route("/api/funnels/:kind/mark-seen", post(funnel::mark_seen))
        .route(
            "/api/funnels/:kind/sessions/:session_id",
            get(funnel::get_funnel).delete(funnel::delete_funnel),
        )
        .route(
            "/api/funnels/:kind/sessions/:session_id/seen",
            patch(funnel::set_seen),
        )
        .route(
            "/api/submissions/:kind",
            get(submission::list_submissions).post(submission::post_submission),
        )
        .route(
            "/api/submissions/:kind/:authid",
            get(submission::get_submission),
        )
        .route(
            "/api/content/:collection",
            get(content::list_content).post(content::create_content),
        )
        .route("/api/content/:collection/active", get(content::active_content))
        .route(
            "/api/content/:collection/documents/:id",
            put(content::update_content).delete(content::delete_content),
        )
        .route(
            "/api/content/:collection/documents/:id/activate",
            post(content::activate_content),
        )
        .route("/api/website-data", get(website::website_data))
        .layer(ConcurrencyLimitLayer::new(concurrency_limit))
        .layer(DefaultBodyLimit::max(max_body_size));

    Router::new()
        .route("/", get(app::index))
        .route("/_readiness", get(app::readiness))
        .route("/_liveness", get(app::index))
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state)
}
