use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::{error, info, warn};

use hasty_core::JobId;
use hasty_events::PublishError;
use hasty_infra::AdmissionError;
use hasty_jobs::{Job, JobEvent};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

enum CreateFailure {
    Admission(AdmissionError),
    Publish(Job, PublishError),
}

/// `POST /` admits a job for `object_id` and publishes `job:created`.
pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };

    let attempt = async {
        let job = services
            .guard
            .admit(&body.object_id)
            .await
            .map_err(CreateFailure::Admission)?;
        services
            .publisher
            .publish_with_retry(&JobEvent::created(job.clone()), &services.publish_retry)
            .await
            .map_err(|e| CreateFailure::Publish(job.clone(), e))?;
        Ok::<_, CreateFailure>(job)
    };

    match tokio::time::timeout(services.request_timeout, attempt).await {
        Ok(Ok(job)) => {
            info!(job_id = %job.job_id, object_id = %job.object_id, "job created");
            (
                StatusCode::CREATED,
                Json(dto::CreateJobResponse { job_id: job.job_id }),
            )
                .into_response()
        }
        Ok(Err(CreateFailure::Admission(e))) => errors::admission_error_to_response(e),
        Ok(Err(CreateFailure::Publish(job, e))) => {
            error!(job_id = %job.job_id, object_id = %job.object_id, error = %e, "job:created publish failed");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, errors::RERUN_MESSAGE)
        }
        Err(_) => {
            warn!(object_id = %body.object_id, timeout = ?services.request_timeout, "job creation timed out");
            errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "timeout")
        }
    }
}

/// `GET /{job_id}` returns the stored job.
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(j) => j,
        Err(resp) => return resp,
    };

    match services.store.find_by_job_id(job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(job)).into_response(),
        Ok(None) => not_found(&id),
        Err(e) => errors::store_error_to_response(e),
    }
}

/// `POST /{job_id}/cancel` asks the workers to cancel an in-flight job.
pub async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&id) {
        Ok(j) => j,
        Err(resp) => return resp,
    };

    let job = match services.store.find_by_job_id(job_id).await {
        Ok(Some(job)) => job,
        Ok(None) => return not_found(&id),
        Err(e) => return errors::store_error_to_response(e),
    };

    if job.status.is_terminal() {
        return errors::json_error(
            StatusCode::CONFLICT,
            format!("job {} is already {}", job.job_id, job.status),
        );
    }

    if let Err(e) = services
        .publisher
        .publish_with_retry(&JobEvent::cancel_requested(job.clone()), &services.publish_retry)
        .await
    {
        error!(job_id = %job.job_id, error = %e, "job:cancel-requested publish failed");
        return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, errors::RERUN_MESSAGE);
    }

    info!(job_id = %job.job_id, object_id = %job.object_id, "cancellation requested");
    (
        StatusCode::ACCEPTED,
        Json(dto::CancelJobResponse {
            job_id: job.job_id,
            status: job.status,
            cancel_requested: true,
        }),
    )
        .into_response()
}

fn parse_job_id(id: &str) -> Result<JobId, axum::response::Response> {
    id.parse::<JobId>()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, format!("invalid job id: {id}")))
}

fn not_found(id: &str) -> axum::response::Response {
    errors::json_error(StatusCode::BAD_REQUEST, format!("job not found: {id}"))
}
