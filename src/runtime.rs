use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{error::ServiceError, model::ValidatedRequest};

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeGeneration {
    pub text: String,
    pub eval_count: Option<usize>,
}

#[async_trait]
pub trait LocalRuntime: Send + Sync {
    async fn list_models(&self) -> Result<Vec<RuntimeModel>, ServiceError>;

    async fn generate(&self, request: &ValidatedRequest) -> Result<RuntimeGeneration, ServiceError>;
}

pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<RuntimeModel>,
}

#[derive(Serialize)]
struct GenerateBody<'a> {
    model: &'a str,
    prompt: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    stream: bool,
    options: GenerateOptions<'a>,
}

#[derive(Serialize)]
struct GenerateOptions<'a> {
    temperature: f32,
    top_p: f32,
    num_predict: usize,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct GenerateReply {
    #[serde(default)]
    response: String,
    #[serde(default)]
    eval_count: Option<usize>,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ServiceError::Other(format!("runtime client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl LocalRuntime for OllamaClient {
    async fn list_models(&self) -> Result<Vec<RuntimeModel>, ServiceError> {
        let reply: TagsResponse = self
            .http
            .get(self.url("/api/tags"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::Other(format!("runtime listing: {e}")))?
            .json()
            .await
            .map_err(|e| ServiceError::Other(format!("runtime listing: {e}")))?;
        Ok(reply.models)
    }

    async fn generate(&self, request: &ValidatedRequest) -> Result<RuntimeGeneration, ServiceError> {
        let body = GenerateBody {
            model: &request.model,
            prompt: &request.prompt,
            system: request.system_prompt.as_deref(),
            stream: false,
            options: GenerateOptions {
                temperature: request.params.temperature,
                top_p: request.params.top_p,
                num_predict: request.params.max_tokens,
                stop: &request.stop_sequences,
            },
        };

        let reply: GenerateReply = self
            .http
            .post(self.url("/api/generate"))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ServiceError::GenerationFailed(format!("runtime: {e}")))?
            .json()
            .await
            .map_err(|e| ServiceError::GenerationFailed(format!("runtime reply: {e}")))?;

        Ok(RuntimeGeneration {
            text: reply.response,
            eval_count: reply.eval_count,
        })
    }
}
