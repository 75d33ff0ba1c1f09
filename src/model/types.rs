use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ServiceError;

#[derive(Debug, Clone, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub system_prompt: Option<String>,
}

fn default_max_tokens() -> usize {
    150
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

impl GenerationRequest {
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            prompt: prompt.into(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            stop_sequences: None,
            system_prompt: None,
        }
    }

    /// Checks the request against the service limits and fills in the model.
    ///
    /// `max_tokens` above the ceiling is rejected; temperature and top-p are
    /// clamped into range.
    pub fn validate(
        self,
        default_model: &str,
        max_tokens_ceiling: usize,
    ) -> Result<ValidatedRequest, ServiceError> {
        if self.prompt.is_empty() {
            return Err(ServiceError::BadRequest("prompt must not be empty".into()));
        }
        if self.max_tokens == 0 || self.max_tokens > max_tokens_ceiling {
            return Err(ServiceError::BadRequest(format!(
                "max_tokens must be between 1 and {max_tokens_ceiling}, got {}",
                self.max_tokens
            )));
        }
        let model = match self.model {
            Some(model) if !model.trim().is_empty() => model,
            _ => default_model.to_string(),
        };

        Ok(ValidatedRequest {
            model,
            prompt: self.prompt,
            params: SamplingParams {
                max_tokens: self.max_tokens,
                temperature: clamp_or(self.temperature, 0.0, 2.0, default_temperature()),
                top_p: clamp_or(self.top_p, 0.0, 1.0, default_top_p()),
            },
            stop_sequences: self.stop_sequences.unwrap_or_default(),
            system_prompt: self.system_prompt,
        })
    }
}

fn clamp_or(value: f32, min: f32, max: f32, fallback: f32) -> f32 {
    if value.is_nan() {
        fallback
    } else {
        value.clamp(min, max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
}

/// A request that passed the boundary checks.
#[derive(Debug, Clone)]
pub struct ValidatedRequest {
    pub model: String,
    pub prompt: String,
    pub params: SamplingParams,
    pub stop_sequences: Vec<String>,
    pub system_prompt: Option<String>,
}

impl ValidatedRequest {
    /// Prompt as fed to a checkpoint, with the system prompt in front.
    pub fn full_prompt(&self) -> String {
        match self.system_prompt.as_deref() {
            Some(system) if !system.is_empty() => format!("{system}\n\n{}", self.prompt),
            _ => self.prompt.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub text: String,
    pub tokens_used: usize,
    pub processing_time_ms: u64,
    pub model_name: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Ollama,
    Peft,
    Hf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ModelKind,
    pub size: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub is_available: bool,
}

/// Human readable byte count, e.g. `1.3 GB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
