use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::monitoring::coordinator::CoordinatorError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::InternalServerError(detail) => {
                // Callers only see the generic message; the detail goes to the log.
                error!(error = %detail, "Request failed with an internal error.");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<CoordinatorError> for AppError {
    fn from(err: CoordinatorError) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repository::StoreError;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_internal_error_hides_detail() {
        let err = CoordinatorError::Store(StoreError::Database(sqlx::Error::Protocol(
            "relation \"monitors\" does not exist".to_string(),
        )));
        let response = AppError::from(err).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({ "error": "Internal server error" }));
    }

    #[tokio::test]
    async fn test_client_errors_keep_their_message() {
        let response = AppError::NotFound("Unknown heartbeat key".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Unknown heartbeat key");
    }
}
