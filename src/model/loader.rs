use std::sync::Arc;

use async_trait::async_trait;
use tokenizers::Tokenizer;

use crate::{
    config::AppConfig,
    error::ServiceError,
    model::{
        adapter::AdapterSource,
        generation::{Checkpoint, LogitsModel},
        hub::{CheckpointFiles, HubFetcher},
    },
};

/// Produces checkpoints and applies adapters to them.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    /// Loads a checkpoint by hub repository id or local directory.
    async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, ServiceError>;

    /// Merges `adapter` into an already loaded base checkpoint.
    async fn load_adapter(
        &self,
        mut base: Checkpoint,
        adapter: &AdapterSource,
    ) -> Result<Checkpoint, ServiceError> {
        let adapter = adapter.clone();
        tokio::task::spawn_blocking(move || {
            base.model.apply_adapter(&adapter)?;
            base.source = format!("{}+{}", base.source, adapter.name);
            Ok(base)
        })
        .await
        .map_err(|err| ServiceError::Other(format!("adapter task failed: {err}")))?
    }
}

#[cfg(feature = "tch-backend")]
type ModuleDevice = tch::Device;
#[cfg(not(feature = "tch-backend"))]
type ModuleDevice = ();

/// Downloads checkpoints from the hub and runs them as TorchScript modules.
pub struct HubModelLoader {
    fetcher: HubFetcher,
    device: ModuleDevice,
}

impl HubModelLoader {
    pub fn new(config: &AppConfig) -> Result<Self, ServiceError> {
        std::fs::create_dir_all(config.hub_cache_dir())?;
        Ok(Self {
            fetcher: HubFetcher::new(config)?,
            #[cfg(feature = "tch-backend")]
            device: config.device,
            #[cfg(not(feature = "tch-backend"))]
            device: (),
        })
    }
}

#[cfg(feature = "tch-backend")]
fn load_module(
    name: &str,
    files: &CheckpointFiles,
    device: ModuleDevice,
) -> Result<Box<dyn LogitsModel>, ServiceError> {
    let model = crate::model::tch_backend::TorchScriptModel::load(name, &files.module, device)?;
    Ok(Box::new(model))
}

#[cfg(not(feature = "tch-backend"))]
fn load_module(
    name: &str,
    _files: &CheckpointFiles,
    _device: ModuleDevice,
) -> Result<Box<dyn LogitsModel>, ServiceError> {
    Err(ServiceError::load_failed(
        name,
        "checkpoint inference requires the tch-backend feature",
    ))
}

#[async_trait]
impl ModelLoader for HubModelLoader {
    async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, ServiceError> {
        let files = self.fetcher.fetch(name).await?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| ServiceError::load_failed(name, format!("tokenizer: {e}")))?;

        let owned_name = name.to_string();
        let device = self.device;
        let module_files = files.clone();
        let model =
            tokio::task::spawn_blocking(move || load_module(&owned_name, &module_files, device))
                .await
                .map_err(|err| ServiceError::Other(format!("model load task failed: {err}")))??;
        tracing::info!(model = name, module = %files.module.display(), "checkpoint loaded");

        Ok(Checkpoint {
            source: name.to_string(),
            tokenizer: Arc::new(tokenizer),
            model,
        })
    }
}
