//! Maps [`CoreError`] onto an HTTP status and JSON body so route handlers
//! never hand-format error responses themselves.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::Json;
use sandbox_core::CoreError;
use serde_json::json;

pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::BadRequest(_) => StatusCode::BAD_REQUEST,
            CoreError::Unauthorized => StatusCode::UNAUTHORIZED,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            CoreError::CapacityExhausted => StatusCode::SERVICE_UNAVAILABLE,
            CoreError::SessionBusy(_) => StatusCode::CONFLICT,
            CoreError::WorkerUnavailable(_) => StatusCode::BAD_GATEWAY,
            CoreError::ExecutionTimeout => StatusCode::GATEWAY_TIMEOUT,
            CoreError::Download(_) => StatusCode::BAD_GATEWAY,
            CoreError::Io(_) | CoreError::Serde(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = Json(json!({ "resultCode": status.as_u16(), "resultMsg": self.0.to_string() }));
        (status, body).into_response()
    }
}
