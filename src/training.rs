use std::{path::Path, sync::Arc, time::Duration};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::ServiceError,
    ledger::{JobStatus, Ledger, TrainingJob},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRequest {
    pub model_name: String,
    pub dataset_path: String,
    pub output_name: String,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_lora_rank")]
    pub lora_rank: u32,
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: u32,
    #[serde(default = "default_use_quantization")]
    pub use_quantization: bool,
}

fn default_epochs() -> u32 {
    3
}

fn default_learning_rate() -> f64 {
    2e-4
}

fn default_batch_size() -> u32 {
    4
}

fn default_lora_rank() -> u32 {
    16
}

fn default_lora_alpha() -> u32 {
    32
}

fn default_use_quantization() -> bool {
    true
}

impl TrainingRequest {
    pub fn validate(&self) -> Result<(), ServiceError> {
        check_range("epochs", self.epochs, 1, 10)?;
        check_range("batch_size", self.batch_size, 1, 32)?;
        check_range("lora_rank", self.lora_rank, 1, 128)?;
        check_range("lora_alpha", self.lora_alpha, 1, 256)?;
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(ServiceError::BadRequest(
                "learning_rate must be greater than 0".into(),
            ));
        }
        for (field, value) in [
            ("model_name", &self.model_name),
            ("dataset_path", &self.dataset_path),
            ("output_name", &self.output_name),
        ] {
            if value.trim().is_empty() {
                return Err(ServiceError::BadRequest(format!("{field} must not be empty")));
            }
        }
        Ok(())
    }
}

fn check_range(field: &str, value: u32, min: u32, max: u32) -> Result<(), ServiceError> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(ServiceError::BadRequest(format!(
            "{field} must be between {min} and {max}, got {value}"
        )))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingAccepted {
    pub task_id: String,
    pub status: String,
    pub message: String,
}

pub struct Trainer {
    ledger: Arc<dyn Ledger>,
    step: Duration,
}

impl Trainer {
    pub fn new(ledger: Arc<dyn Ledger>, step: Duration) -> Self {
        Self { ledger, step }
    }

    /// Records a pending job and starts its runner in the background.
    pub async fn submit(&self, request: TrainingRequest) -> Result<TrainingAccepted, ServiceError> {
        request.validate()?;

        let job = TrainingJob {
            id: Uuid::new_v4().to_string(),
            model_name: request.model_name.clone(),
            dataset_path: request.dataset_path.clone(),
            output_name: request.output_name.clone(),
            status: JobStatus::Pending,
            progress: 0.0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            config: serde_json::to_value(&request)
                .map_err(|e| ServiceError::Other(e.to_string()))?,
        };
        self.ledger.save_job(job.clone()).await?;
        info!(task_id = %job.id, model = %job.model_name, "training task accepted");

        let runner = JobRunner {
            ledger: self.ledger.clone(),
            step: self.step,
            epochs: request.epochs,
        };
        let task_id = job.id.clone();
        tokio::spawn(async move { runner.run(job).await });

        Ok(TrainingAccepted {
            task_id,
            status: "started".to_string(),
            message: "Training task started successfully".to_string(),
        })
    }
}

// Placeholder runner: no weights change, progress advances once per epoch.
struct JobRunner {
    ledger: Arc<dyn Ledger>,
    step: Duration,
    epochs: u32,
}

impl JobRunner {
    async fn run(self, mut job: TrainingJob) {
        if let Err(err) = self.drive(&mut job).await {
            error!(task_id = %job.id, error = %err, "training task failed");
            job.status = JobStatus::Failed;
            job.completed_at = Some(Utc::now());
            job.error_message = Some(err.to_string());
            if let Err(err) = self.ledger.save_job(job.clone()).await {
                error!(task_id = %job.id, error = %err, "failed to record training failure");
            }
        }
    }

    async fn drive(&self, job: &mut TrainingJob) -> Result<(), ServiceError> {
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        self.ledger.save_job(job.clone()).await?;
        info!(task_id = %job.id, "training task started");

        if tokio::fs::metadata(Path::new(&job.dataset_path)).await.is_err() {
            return Err(ServiceError::NotFound(format!(
                "dataset not found: {}",
                job.dataset_path
            )));
        }

        for epoch in 1..=self.epochs {
            tokio::time::sleep(self.step).await;
            job.progress = f64::from(epoch) / f64::from(self.epochs) * 100.0;
            self.ledger.save_job(job.clone()).await?;
            info!(task_id = %job.id, epoch, progress = job.progress, "epoch finished");
        }

        job.status = JobStatus::Completed;
        job.progress = 100.0;
        job.completed_at = Some(Utc::now());
        self.ledger.save_job(job.clone()).await?;
        info!(task_id = %job.id, "training task completed");
        Ok(())
    }
}
