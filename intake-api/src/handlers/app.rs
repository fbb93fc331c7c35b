use axum::extract::State;
use axum::http::StatusCode;

use intake_common::store::Store;

use crate::router::AppState;

pub async fn index() -> &'static str {
    "intake api"
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::error!("readiness check failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt; // for `collect`
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    use intake_common::store::MemoryStore;
    use intake_common::time::SystemTime;

    use crate::router::{router, AppState};

    use super::*;

    #[tokio::test]
    async fn index() {
        let timesource = Arc::new(SystemTime {});
        let state = AppState::new(
            Arc::new(MemoryStore::new(timesource.clone())),
            timesource,
            Duration::from_secs(300),
            None,
        );
        let app = router(state, 1_000_000, 10);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"intake api");

        let response = app
            .oneshot(Request::builder().uri("/_readiness").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
