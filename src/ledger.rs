use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServiceError;

#[derive(Debug, Clone, Serialize)]
pub struct RequestLog {
    pub id: String,
    pub model_name: String,
    pub prompt_length: usize,
    pub tokens_generated: usize,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
    pub error_message: Option<String>,
}

impl RequestLog {
    pub fn success(model_name: &str, prompt: &str, tokens: usize, elapsed_ms: u64) -> Self {
        Self::new(model_name, prompt, tokens, elapsed_ms, None)
    }

    pub fn failure(model_name: &str, prompt: &str, elapsed_ms: u64, error: String) -> Self {
        Self::new(model_name, prompt, 0, elapsed_ms, Some(error))
    }

    fn new(
        model_name: &str,
        prompt: &str,
        tokens_generated: usize,
        processing_time_ms: u64,
        error_message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            model_name: model_name.to_string(),
            prompt_length: prompt.chars().count(),
            tokens_generated,
            processing_time_ms,
            timestamp: Utc::now(),
            success: error_message.is_none(),
            error_message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingJob {
    pub id: String,
    pub model_name: String,
    pub dataset_path: String,
    pub output_name: String,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub config: serde_json::Value,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn record_request(&self, entry: RequestLog) -> Result<(), ServiceError>;

    async fn requests(&self) -> Result<Vec<RequestLog>, ServiceError>;

    /// Inserts or replaces the job with the same id.
    async fn save_job(&self, job: TrainingJob) -> Result<(), ServiceError>;

    async fn job(&self, id: &str) -> Result<Option<TrainingJob>, ServiceError>;
}

#[derive(Default)]
pub struct MemoryLedger {
    requests: RwLock<Vec<RequestLog>>,
    jobs: RwLock<HashMap<String, TrainingJob>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn record_request(&self, entry: RequestLog) -> Result<(), ServiceError> {
        self.requests.write().push(entry);
        Ok(())
    }

    async fn requests(&self) -> Result<Vec<RequestLog>, ServiceError> {
        Ok(self.requests.read().clone())
    }

    async fn save_job(&self, job: TrainingJob) -> Result<(), ServiceError> {
        self.jobs.write().insert(job.id.clone(), job);
        Ok(())
    }

    async fn job(&self, id: &str) -> Result<Option<TrainingJob>, ServiceError> {
        Ok(self.jobs.read().get(id).cloned())
    }
}
