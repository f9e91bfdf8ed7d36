//! Queue job payloads and their processing

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::core::ExecutionRequest;
use crate::error::ExecError;
use crate::hpc::ClusterJobSpec;
use crate::manager::Manager;

/// Worker job enum - represents different types of jobs the worker can process
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "job_type")]
pub enum WorkerJob {
    /// Run a script in the sandbox
    #[serde(rename = "execute")]
    Execute(ExecuteJob),
    /// Hand a script off to the batch scheduler
    #[serde(rename = "cluster_submit")]
    ClusterSubmit(ClusterSubmitJob),
    /// Poll a cluster job
    #[serde(rename = "cluster_status")]
    ClusterStatus(ClusterStatusJob),
    /// Read a user's execution stats
    #[serde(rename = "user_stats")]
    UserStats(UserStatsJob),
}

impl WorkerJob {
    pub fn request_id(&self) -> &str {
        match self {
            WorkerJob::Execute(job) => &job.request_id,
            WorkerJob::ClusterSubmit(job) => &job.request_id,
            WorkerJob::ClusterStatus(job) => &job.request_id,
            WorkerJob::UserStats(job) => &job.request_id,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            WorkerJob::Execute(_) => "execute",
            WorkerJob::ClusterSubmit(_) => "cluster_submit",
            WorkerJob::ClusterStatus(_) => "cluster_status",
            WorkerJob::UserStats(_) => "user_stats",
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ExecuteJob {
    pub request_id: String,
    #[serde(flatten)]
    pub request: ExecutionRequest,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterSubmitJob {
    pub request_id: String,
    pub user_id: String,
    pub script_path: String,
    #[serde(default)]
    pub spec: ClusterJobSpec,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClusterStatusJob {
    pub request_id: String,
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserStatsJob {
    pub request_id: String,
    pub user_id: String,
}

/// Reply stored for one processed job
#[derive(Debug, Serialize, Deserialize)]
pub struct JobReply {
    pub request_id: String,
    /// False when the job could not be processed at all
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl JobReply {
    fn ok(request_id: &str, data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Self {
                request_id: request_id.to_string(),
                success: true,
                data: Some(data),
                error_message: None,
            },
            Err(e) => Self::failed(request_id, format!("Failed to encode reply: {}", e)),
        }
    }

    fn failed(request_id: &str, message: String) -> Self {
        Self {
            request_id: request_id.to_string(),
            success: false,
            data: None,
            error_message: Some(message),
        }
    }
}

/// Process one job against the manager
pub async fn process_job(manager: &Manager, job: &WorkerJob) -> JobReply {
    let request_id = job.request_id();
    info!("Received {} job: request_id={}", job.kind(), request_id);

    let result: Result<JobReply, ExecError> = match job {
        WorkerJob::Execute(job) => manager
            .execute(&job.request)
            .await
            .map(|outcome| JobReply::ok(request_id, outcome)),
        WorkerJob::ClusterSubmit(job) => manager
            .submit_to_cluster(&job.user_id, &job.script_path, &job.spec)
            .await
            .map(|job_id| JobReply::ok(request_id, serde_json::json!({ "job_id": job_id }))),
        WorkerJob::ClusterStatus(job) => manager
            .get_cluster_job_status(&job.job_id)
            .await
            .map(|status| JobReply::ok(request_id, status)),
        WorkerJob::UserStats(job) => {
            let stats = manager.get_user_stats(&job.user_id).await;
            Ok(JobReply::ok(request_id, stats))
        }
    };

    match result {
        Ok(reply) => reply,
        Err(e) => {
            error!("Failed to process {} job {}: {}", job.kind(), request_id, e);
            JobReply::failed(request_id, e.to_string())
        }
    }
}
