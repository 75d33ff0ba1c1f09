use std::{sync::Arc, time::Duration};

use tokio::{task, time::Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    cache::{ResponseCache, cache_key},
    error::ServiceError,
    model::{GenerationResult, LoadedModel, ModelHandle, ModelRouter, ValidatedRequest},
    sampling::apply_stop_sequences,
};

pub struct InferenceService {
    router: Arc<ModelRouter>,
    cache: Arc<dyn ResponseCache>,
    cache_ttl: Duration,
}

impl InferenceService {
    pub fn new(router: Arc<ModelRouter>, cache: Arc<dyn ResponseCache>, cache_ttl: Duration) -> Self {
        Self {
            router,
            cache,
            cache_ttl,
        }
    }

    pub fn router(&self) -> &Arc<ModelRouter> {
        &self.router
    }

    pub async fn generate(&self, request: ValidatedRequest) -> Result<GenerationResult, ServiceError> {
        let key = cache_key(&request.prompt, &request.model);
        if let Some(hit) = self.cached(&key).await {
            debug!(model = %request.model, "serving cached generation");
            return Ok(hit);
        }

        let handle = self.router.resolve(&request.model, false).await?;

        let start = Instant::now();
        let (text, tokens_used) = match &handle {
            ModelHandle::LocalRuntime { .. } => {
                let reply = self.router.runtime().generate(&request).await?;
                (reply.text, reply.eval_count.unwrap_or(0))
            }
            ModelHandle::Adapter(model) | ModelHandle::Checkpoint(model) => {
                run_checkpoint(model.clone(), &request).await?
            }
        };
        let elapsed = start.elapsed();

        let result = GenerationResult {
            text,
            tokens_used,
            processing_time_ms: elapsed.as_millis() as u64,
            model_name: request.model.clone(),
            request_id: Uuid::new_v4().to_string(),
        };

        self.store(&key, &result).await;
        Ok(result)
    }

    async fn cached(&self, key: &str) -> Option<GenerationResult> {
        let raw = match self.cache.get(key).await {
            Ok(raw) => raw?,
            Err(err) => {
                warn!(error = %err, "cache read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(result) => Some(result),
            Err(err) => {
                warn!(error = %err, "discarding undecodable cache entry");
                None
            }
        }
    }

    async fn store(&self, key: &str, result: &GenerationResult) {
        let raw = match serde_json::to_string(result) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(error = %err, "failed to serialize generation for cache");
                return;
            }
        };
        if let Err(err) = self.cache.put(key, raw, self.cache_ttl).await {
            warn!(error = %err, "cache write failed");
        }
    }
}

async fn run_checkpoint(
    model: Arc<LoadedModel>,
    request: &ValidatedRequest,
) -> Result<(String, usize), ServiceError> {
    let prompt = request.full_prompt();
    let params = request.params;
    let completion = task::spawn_blocking(move || model.generator.generate(&prompt, &params))
        .await
        .map_err(|err| ServiceError::GenerationFailed(format!("inference task failed: {err}")))?
        .map_err(|err| match err {
            ServiceError::GenerationFailed(_) => err,
            other => ServiceError::GenerationFailed(other.to_string()),
        })?;

    let text = apply_stop_sequences(&completion.text, &request.stop_sequences);
    Ok((text, completion.tokens))
}
