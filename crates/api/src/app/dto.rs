use serde::{Deserialize, Serialize};

use hasty_core::JobId;
use hasty_jobs::JobStatus;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub object_id: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct CancelJobResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub cancel_requested: bool,
}
