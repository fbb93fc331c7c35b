use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use metrics::counter;
use serde_derive::Deserialize;
use serde_json::{Map, Value};
use tracing::instrument;

use intake_common::store::SubmissionStore;
use intake_common::submission::{
    base_authid, MissingAuthid, NewSubmission, Submission, SubmissionKind,
};

use crate::api::{created, ok, ApiError, ApiResponse};
use crate::router::AppState;

/// A questionnaire submission: the `authid` plus every other answer field.
#[derive(Debug, Deserialize)]
pub struct SubmissionBody {
    pub authid: Option<String>,
    #[serde(flatten)]
    pub answers: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
pub struct AuthidQuery {
    pub authid: Option<String>,
}

#[instrument(skip_all, fields(kind, authid))]
pub async fn post_submission(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    payload: Result<Json<SubmissionBody>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<Submission>>), ApiError> {
    let kind: SubmissionKind = kind.parse()?;
    tracing::Span::current().record("kind", kind.as_str());
    let Json(body) = payload?;

    let authid = body.authid.ok_or(MissingAuthid)?;
    let submission = NewSubmission::new(kind, &authid, body.answers)?;

    let stored = state.store.insert_submission(submission).await?;
    tracing::Span::current().record("authid", stored.authid.as_str());
    counter!("intake_submissions_total", "kind" => kind.as_str()).increment(1);

    Ok(created(stored))
}

/// Every submission sharing the base of `?authid=`, oldest first.
#[instrument(skip_all, fields(kind))]
pub async fn list_submissions(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    query: Result<Query<AuthidQuery>, QueryRejection>,
) -> Result<Json<ApiResponse<Vec<Submission>>>, ApiError> {
    let kind: SubmissionKind = kind.parse()?;
    let Query(query) = query?;

    let authid = query.authid.as_deref().map(str::trim).unwrap_or_default();
    let base = base_authid(authid);
    if base.is_empty() {
        return Err(MissingAuthid.into());
    }

    Ok(ok(state.store.list_submissions(kind, base).await?))
}

#[instrument(skip_all, fields(kind, authid = %authid))]
pub async fn get_submission(
    State(state): State<AppState>,
    Path((kind, authid)): Path<(String, String)>,
) -> Result<Json<ApiResponse<Submission>>, ApiError> {
    let kind: SubmissionKind = kind.parse()?;

    match state.store.get_submission(kind, &authid).await? {
        Some(submission) => Ok(ok(submission)),
        None => Err(ApiError::NotFound(format!("submission {authid}"))),
    }
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{self, Request, StatusCode},
        Router,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::test_utils::setup_app;

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_refill(body: Value) -> Request<Body> {
        Request::builder()
            .method(http::Method::POST)
            .uri("/api/submissions/refill")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn repeated_authids_are_suffixed() {
        let (_clock, app) = setup_app(None);

        let mut stored = Vec::new();
        for dose in ["2.5mg", "5mg", "7.5mg"] {
            let (status, body) =
                send(&app, post_refill(json!({"authid": "P100", "dose": dose}))).await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(body["result"]["dose"], Value::Null);
            assert_eq!(body["result"]["answers"]["dose"], json!(dose));
            stored.push(body["result"]["authid"].as_str().unwrap().to_owned());
        }

        assert_eq!(stored, vec!["P100", "P100-1", "P100-2"]);
    }

    #[tokio::test]
    async fn suffixed_authid_counts_towards_its_base() {
        let (_clock, app) = setup_app(None);

        send(&app, post_refill(json!({"authid": "P200"}))).await;
        let (_, body) = send(&app, post_refill(json!({"authid": "P200-7"}))).await;

        assert_eq!(body["result"]["authid"], json!("P200-1"));
        assert_eq!(body["result"]["baseAuthid"], json!("P200"));
    }

    #[tokio::test]
    async fn missing_authid_is_rejected() {
        let (_clock, app) = setup_app(None);

        let (status, body) = send(&app, post_refill(json!({"dose": "5mg"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "message": "authid is required"}));

        let (status, _) = send(&app, post_refill(json!({"authid": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_returns_family_oldest_first() {
        let (_clock, app) = setup_app(None);
        send(&app, post_refill(json!({"authid": "P300"}))).await;
        send(&app, post_refill(json!({"authid": "P300"}))).await;
        send(&app, post_refill(json!({"authid": "P301"}))).await;

        let request = Request::builder()
            .uri("/api/submissions/refills?authid=P300-1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        let authids: Vec<&str> = body["result"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["authid"].as_str().unwrap())
            .collect();
        assert_eq!(authids, vec!["P300", "P300-1"]);
    }

    #[tokio::test]
    async fn get_single_submission() {
        let (_clock, app) = setup_app(None);
        send(&app, post_refill(json!({"authid": "P400"}))).await;
        send(&app, post_refill(json!({"authid": "P400"}))).await;

        let request = Request::builder()
            .uri("/api/submissions/refill/P400-1")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["result"]["authid"], json!("P400-1"));

        let request = Request::builder()
            .uri("/api/submissions/refill/P400-9")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_submission_kind_is_not_found() {
        let (_clock, app) = setup_app(None);

        let request = Request::builder()
            .method(http::Method::POST)
            .uri("/api/submissions/renewals")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"authid": "P1"}).to_string()))
            .unwrap();
        let (status, _) = send(&app, request).await;

        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
