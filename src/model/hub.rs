use std::path::{Path, PathBuf};

use hf_hub::api::tokio::{Api, ApiBuilder};

use crate::{config::AppConfig, error::ServiceError};

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Local paths of the files making up one checkpoint.
#[derive(Debug, Clone)]
pub struct CheckpointFiles {
    pub tokenizer: PathBuf,
    pub module: PathBuf,
}

/// Resolves checkpoint files from a directory under the models root or the
/// model hub.
pub struct HubFetcher {
    api: Api,
    local_root: PathBuf,
    module_file: String,
}

impl HubFetcher {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        let mut builder = ApiBuilder::new()
            .with_cache_dir(config.hub_cache_dir())
            .with_progress(false);
        if let Some(endpoint) = &config.hub_endpoint {
            builder = builder.with_endpoint(endpoint.clone());
        }
        let api = builder
            .build()
            .map_err(|e| ServiceError::Other(format!("hub client: {e}")))?;
        Ok(Self {
            api,
            local_root: config.models_dir.clone(),
            module_file: config.checkpoint_module_file.clone(),
        })
    }

    pub async fn fetch(&self, name: &str) -> Result<CheckpointFiles, ServiceError> {
        if let Some(dir) = self.local_dir(name) {
            return self.from_dir(name, &dir);
        }
        if !is_repo_id(name) {
            return Err(ServiceError::ModelUnavailable(name.to_string()));
        }

        tracing::info!(repo = name, "fetching checkpoint from hub");
        let repo = self.api.model(name.to_string());
        // The tokenizer is the first lookup; a 404 here means the repo is unknown.
        let tokenizer = repo.get(TOKENIZER_FILE).await.map_err(|e| {
            if is_not_found(&e) {
                ServiceError::ModelUnavailable(name.to_string())
            } else {
                ServiceError::load_failed(name, e)
            }
        })?;
        let module = repo.get(&self.module_file).await.map_err(|e| {
            if is_not_found(&e) {
                ServiceError::load_failed(name, format!("missing {}", self.module_file))
            } else {
                ServiceError::load_failed(name, e)
            }
        })?;

        Ok(CheckpointFiles { tokenizer, module })
    }

    // Only directories inside the models root count as local checkpoints.
    fn local_dir(&self, name: &str) -> Option<PathBuf> {
        let root = self.local_root.canonicalize().ok()?;
        let dir = root.join(name).canonicalize().ok()?;
        (dir != root && dir.is_dir() && dir.starts_with(&root)).then_some(dir)
    }

    fn from_dir(&self, name: &str, dir: &Path) -> Result<CheckpointFiles, ServiceError> {
        let tokenizer = dir.join(TOKENIZER_FILE);
        let module = dir.join(&self.module_file);
        for path in [&tokenizer, &module] {
            if !path.is_file() {
                return Err(ServiceError::load_failed(
                    name,
                    format!("missing checkpoint file {}", path.display()),
                ));
            }
        }
        Ok(CheckpointFiles { tokenizer, module })
    }
}

/// `owner/name` or a bare `name` made of the characters the hub accepts.
pub fn is_repo_id(name: &str) -> bool {
    let parts: Vec<&str> = name.split('/').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        !part.is_empty()
            && !part.starts_with('.')
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    })
}

fn is_not_found(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(http) = err.downcast_ref::<reqwest::Error>() {
            if http.status() == Some(reqwest::StatusCode::NOT_FOUND) {
                return true;
            }
        }
        current = err.source();
    }
    err.to_string().contains("404 Not Found")
}
