use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/", post(jobs::create_job))
        .route("/:job_id", get(jobs::get_job))
        .route("/:job_id/cancel", post(jobs::cancel_job))
}
