use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

use intake_common::content::InvalidCollection;
use intake_common::funnel::{MissingSessionId, ParseFunnelKindError};
use intake_common::states::StateFilterError;
use intake_common::store::StoreError;
use intake_common::submission::{MissingAuthid, ParseSubmissionKindError};

/// Every successful response is wrapped as `{"success": true, "result": ...}`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub result: T,
}

pub fn ok<T: Serialize>(result: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        result,
    })
}

pub fn created<T: Serialize>(result: T) -> (StatusCode, Json<ApiResponse<T>>) {
    (StatusCode::CREATED, ok(result))
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    MissingSessionId(#[from] MissingSessionId),
    #[error(transparent)]
    MissingAuthid(#[from] MissingAuthid),
    #[error(transparent)]
    InvalidStates(#[from] StateFilterError),
    #[error(transparent)]
    InvalidCollection(#[from] InvalidCollection),
    #[error("failed to parse request body: {0}")]
    InvalidBody(String),
    #[error("failed to parse query string: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    UnknownFunnelKind(#[from] ParseFunnelKindError),
    #[error(transparent)]
    UnknownSubmissionKind(#[from] ParseSubmissionKindError),
    #[error("{0} not found")]
    NotFound(String),

    #[error("admin authorization required")]
    Unauthorized,

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict(_) | StoreError::SequenceExhausted(_) => {
                ApiError::Conflict(error.to_string())
            }
            error => ApiError::Store(error),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidBody(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::InvalidQuery(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingSessionId(_)
            | ApiError::MissingAuthid(_)
            | ApiError::InvalidStates(_)
            | ApiError::InvalidCollection(_)
            | ApiError::InvalidBody(_)
            | ApiError::InvalidQuery(_) => StatusCode::BAD_REQUEST,

            ApiError::UnknownFunnelKind(_)
            | ApiError::UnknownSubmissionKind(_)
            | ApiError::NotFound(_) => StatusCode::NOT_FOUND,

            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,

            ApiError::Conflict(_) => StatusCode::CONFLICT,

            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("internal error: {}", self);
        } else {
            tracing::debug!(status = status.as_u16(), "rejected request: {}", self);
        }

        (
            status,
            Json(json!({
                "success": false,
                "message": self.to_string(),
            })),
        )
            .into_response()
    }
}
