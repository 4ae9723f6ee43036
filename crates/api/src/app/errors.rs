use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;
use tracing::error;

use hasty_infra::AdmissionError;
use hasty_infra::jobs::JobStoreError;

/// Returned when the job was admitted but `job:created` could not be published.
pub const RERUN_MESSAGE: &str = "please rerun the job";

pub fn admission_error_to_response(err: AdmissionError) -> axum::response::Response {
    match err {
        AdmissionError::InvalidObjectId(_) | AdmissionError::CooldownActive { .. } => {
            json_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        AdmissionError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    match err {
        JobStoreError::NotFound(_) | JobStoreError::InvalidTransition(_) => {
            json_error(StatusCode::BAD_REQUEST, err.to_string())
        }
        JobStoreError::AlreadyExists(_) | JobStoreError::Storage(_) => {
            error!(error = %err, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

pub fn json_error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "message": message.into(),
        })),
    )
        .into_response()
}
