use std::{collections::HashMap, path::PathBuf, sync::Arc};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::{
    error::ServiceError,
    model::{
        ModelInfo, ModelKind,
        adapter::{find_adapter, scan_adapters},
        format_size,
        generation::{CausalGenerator, GenerationSettings, TextGenerator},
        loader::ModelLoader,
    },
    runtime::LocalRuntime,
};

/// A model held in memory, ready to generate.
pub struct LoadedModel {
    pub name: String,
    /// Checkpoint the weights came from, `base+adapter` for adapters.
    pub source: String,
    pub generator: Arc<dyn TextGenerator>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub enum ModelHandle {
    /// Served by the local runtime, which manages its own weights.
    LocalRuntime { name: String },
    Adapter(Arc<LoadedModel>),
    Checkpoint(Arc<LoadedModel>),
}

impl ModelHandle {
    pub fn kind(&self) -> ModelKind {
        match self {
            ModelHandle::LocalRuntime { .. } => ModelKind::Ollama,
            ModelHandle::Adapter(_) => ModelKind::Peft,
            ModelHandle::Checkpoint(_) => ModelKind::Hf,
        }
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelHandle::LocalRuntime { name } => write!(f, "LocalRuntime({name})"),
            ModelHandle::Adapter(model) => write!(f, "Adapter({})", model.source),
            ModelHandle::Checkpoint(model) => write!(f, "Checkpoint({})", model.source),
        }
    }
}

/// Decides which backend owns a model name and keeps loaded models around.
pub struct ModelRouter {
    runtime: Arc<dyn LocalRuntime>,
    loader: Arc<dyn ModelLoader>,
    adapters_dir: PathBuf,
    settings: GenerationSettings,
    registry: RwLock<HashMap<String, ModelHandle>>,
}

impl ModelRouter {
    pub fn new(
        runtime: Arc<dyn LocalRuntime>,
        loader: Arc<dyn ModelLoader>,
        adapters_dir: PathBuf,
        settings: GenerationSettings,
    ) -> Self {
        Self {
            runtime,
            loader,
            adapters_dir,
            settings,
            registry: RwLock::new(HashMap::new()),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn LocalRuntime> {
        &self.runtime
    }

    pub fn loaded_count(&self) -> usize {
        self.registry.read().len()
    }

    /// Resolution order: registry, local runtime listing, adapter directory,
    /// hub checkpoint. `force_reload` skips the registry and replaces the
    /// entry; concurrent reloads of one name race and the last one wins.
    pub async fn resolve(&self, name: &str, force_reload: bool) -> Result<ModelHandle, ServiceError> {
        if !force_reload {
            if let Some(handle) = self.registry.read().get(name).cloned() {
                return Ok(handle);
            }
        }

        if self.is_runtime_model(name).await {
            info!(model = name, "using local runtime model");
            if force_reload && self.registry.write().remove(name).is_some() {
                info!(model = name, "dropped loaded model now served by the local runtime");
            }
            return Ok(ModelHandle::LocalRuntime {
                name: name.to_string(),
            });
        }

        let handle = if let Some(adapter) = find_adapter(&self.adapters_dir, name)? {
            info!(
                model = name,
                base = %adapter.config.base_model_name_or_path,
                "loading adapter"
            );
            let base = self
                .loader
                .load_checkpoint(&adapter.config.base_model_name_or_path)
                .await
                .map_err(|err| as_load_failure(name, err))?;
            let merged = self
                .loader
                .load_adapter(base, &adapter)
                .await
                .map_err(|err| as_load_failure(name, err))?;
            ModelHandle::Adapter(Arc::new(self.wrap(name, merged)))
        } else {
            info!(model = name, "loading checkpoint");
            let checkpoint = self.loader.load_checkpoint(name).await?;
            ModelHandle::Checkpoint(Arc::new(self.wrap(name, checkpoint)))
        };

        self.registry
            .write()
            .insert(name.to_string(), handle.clone());
        info!(model = name, kind = ?handle.kind(), "model registered");
        Ok(handle)
    }

    async fn is_runtime_model(&self, name: &str) -> bool {
        match self.runtime.list_models().await {
            Ok(models) => models.iter().any(|m| m.name == name),
            Err(err) => {
                warn!(error = %err, "local runtime listing unavailable");
                false
            }
        }
    }

    fn wrap(&self, name: &str, checkpoint: crate::model::Checkpoint) -> LoadedModel {
        LoadedModel {
            name: name.to_string(),
            source: checkpoint.source.clone(),
            generator: Arc::new(CausalGenerator::new(checkpoint, self.settings)),
            loaded_at: Utc::now(),
        }
    }

    /// Runtime models, adapters on disk and loaded checkpoints. A failing
    /// source is logged and left out.
    pub async fn list_models(&self) -> Vec<ModelInfo> {
        let mut models = Vec::new();

        match self.runtime.list_models().await {
            Ok(listed) => models.extend(listed.into_iter().map(|m| ModelInfo {
                description: format!("Ollama model: {}", m.name),
                size: m.size.map(format_size).unwrap_or_else(|| "Unknown".to_string()),
                created_at: m.modified_at.unwrap_or_else(Utc::now),
                name: m.name,
                kind: ModelKind::Ollama,
                is_available: true,
            })),
            Err(err) => warn!(error = %err, "failed to list local runtime models"),
        }

        models.extend(scan_adapters(&self.adapters_dir).into_iter().map(|a| ModelInfo {
            description: format!("Fine-tuned model: {}", a.name),
            size: format_size(a.size_bytes),
            created_at: a.created_at,
            name: a.name,
            kind: ModelKind::Peft,
            is_available: true,
        }));

        let registry = self.registry.read();
        let mut checkpoints: Vec<_> = registry
            .values()
            .filter_map(|handle| match handle {
                ModelHandle::Checkpoint(model) => Some(model.clone()),
                _ => None,
            })
            .collect();
        checkpoints.sort_by(|a, b| a.name.cmp(&b.name));
        models.extend(checkpoints.into_iter().map(|model| ModelInfo {
            name: model.name.clone(),
            kind: ModelKind::Hf,
            size: "Unknown".to_string(),
            description: format!("Hub checkpoint: {}", model.source),
            created_at: model.loaded_at,
            is_available: true,
        }));

        models
    }
}

// Adapter loads report under the adapter's name, not the base checkpoint's.
fn as_load_failure(name: &str, err: ServiceError) -> ServiceError {
    match err {
        ServiceError::ModelLoadFailed { model, cause } if model != name => {
            ServiceError::load_failed(name, format!("{model}: {cause}"))
        }
        ServiceError::ModelUnavailable(base) => {
            ServiceError::load_failed(name, format!("base model '{base}' is unavailable"))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        model::{
            Checkpoint, SamplingParams, ValidatedRequest, adapter::AdapterSource,
            generation::testing::scripted_checkpoint,
        },
        runtime::{RuntimeGeneration, RuntimeModel},
    };

    struct FakeRuntime {
        models: Mutex<Vec<&'static str>>,
        fail_listing: bool,
    }

    #[async_trait]
    impl LocalRuntime for FakeRuntime {
        async fn list_models(&self) -> Result<Vec<RuntimeModel>, ServiceError> {
            if self.fail_listing {
                return Err(ServiceError::Other("connection refused".into()));
            }
            Ok(self
                .models
                .lock()
                .iter()
                .map(|name| RuntimeModel {
                    name: name.to_string(),
                    size: Some(2048),
                    modified_at: None,
                })
                .collect())
        }

        async fn generate(&self, _: &ValidatedRequest) -> Result<RuntimeGeneration, ServiceError> {
            unreachable!("router never generates")
        }
    }

    #[derive(Default)]
    struct RecordingLoader {
        calls: Mutex<Vec<String>>,
        checkpoint_loads: AtomicUsize,
        missing: Vec<&'static str>,
    }

    #[async_trait]
    impl ModelLoader for RecordingLoader {
        async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, ServiceError> {
            self.calls.lock().push(format!("checkpoint:{name}"));
            self.checkpoint_loads.fetch_add(1, Ordering::SeqCst);
            if self.missing.contains(&name) {
                return Err(ServiceError::ModelUnavailable(name.to_string()));
            }
            Ok(scripted_checkpoint(name, &["abc"]))
        }

        async fn load_adapter(
            &self,
            mut base: Checkpoint,
            adapter: &AdapterSource,
        ) -> Result<Checkpoint, ServiceError> {
            self.calls.lock().push(format!("adapter:{}", adapter.name));
            base.model.apply_adapter(adapter)?;
            base.source = format!("{}+{}", base.source, adapter.name);
            Ok(base)
        }
    }

    fn settings() -> GenerationSettings {
        GenerationSettings {
            max_input_tokens: 2048,
            repetition_penalty: 1.1,
        }
    }

    fn router(
        runtime: FakeRuntime,
        loader: Arc<RecordingLoader>,
        adapters_dir: PathBuf,
    ) -> ModelRouter {
        ModelRouter::new(Arc::new(runtime), loader, adapters_dir, settings())
    }

    fn write_adapter(root: &std::path::Path, name: &str, base: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("adapter_config.json"),
            format!(r#"{{"base_model_name_or_path":"{base}","r":8,"lora_alpha":16}}"#),
        )
        .unwrap();
    }

    #[tokio::test]
    async fn runtime_models_skip_all_loading() {
        let tmp = tempfile::tempdir().unwrap();
        // an adapter of the same name must not be consulted
        write_adapter(tmp.path(), "llama3.2:1b", "gpt2");
        let loader = Arc::new(RecordingLoader::default());
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec!["llama3.2:1b", "mistral:7b"]),
                fail_listing: false,
            },
            loader.clone(),
            tmp.path().to_path_buf(),
        );

        let handle = router.resolve("llama3.2:1b", false).await.unwrap();
        assert_eq!(handle.kind(), ModelKind::Ollama);
        assert!(loader.calls.lock().is_empty());
        assert_eq!(router.loaded_count(), 0);
    }

    #[tokio::test]
    async fn adapter_loads_base_before_adapter() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path(), "support-bot", "gpt2");
        let loader = Arc::new(RecordingLoader::default());
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec![]),
                fail_listing: false,
            },
            loader.clone(),
            tmp.path().to_path_buf(),
        );

        let handle = router.resolve("support-bot", false).await.unwrap();
        assert_eq!(handle.kind(), ModelKind::Peft);
        assert_eq!(
            *loader.calls.lock(),
            vec!["checkpoint:gpt2".to_string(), "adapter:support-bot".to_string()]
        );
        match handle {
            ModelHandle::Adapter(model) => assert_eq!(model.source, "gpt2+support-bot"),
            other => panic!("unexpected handle {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_names_load_as_checkpoints_and_are_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = Arc::new(RecordingLoader::default());
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec![]),
                fail_listing: true,
            },
            loader.clone(),
            tmp.path().to_path_buf(),
        );

        let first = router.resolve("gpt2", false).await.unwrap();
        assert_eq!(first.kind(), ModelKind::Hf);
        router.resolve("gpt2", false).await.unwrap();
        assert_eq!(loader.checkpoint_loads.load(Ordering::SeqCst), 1);
        assert_eq!(router.loaded_count(), 1);
    }

    #[tokio::test]
    async fn force_reload_replaces_registry_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = Arc::new(RecordingLoader::default());
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec![]),
                fail_listing: false,
            },
            loader.clone(),
            tmp.path().to_path_buf(),
        );

        let first = router.resolve("gpt2", false).await.unwrap();
        let second = router.resolve("gpt2", true).await.unwrap();
        assert_eq!(loader.checkpoint_loads.load(Ordering::SeqCst), 2);
        assert_eq!(router.loaded_count(), 1);
        match (first, second) {
            (ModelHandle::Checkpoint(a), ModelHandle::Checkpoint(b)) => {
                assert!(!Arc::ptr_eq(&a, &b))
            }
            other => panic!("unexpected handles {other:?}"),
        }
    }

    #[tokio::test]
    async fn forced_reload_onto_runtime_drops_loaded_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = Arc::new(RecordingLoader::default());
        let runtime = Arc::new(FakeRuntime {
            models: Mutex::new(vec![]),
            fail_listing: false,
        });
        let router = ModelRouter::new(
            runtime.clone(),
            loader,
            tmp.path().to_path_buf(),
            settings(),
        );

        assert_eq!(router.resolve("gpt2", false).await.unwrap().kind(), ModelKind::Hf);
        runtime.models.lock().push("gpt2");

        let forced = router.resolve("gpt2", true).await.unwrap();
        assert_eq!(forced.kind(), ModelKind::Ollama);
        assert_eq!(router.loaded_count(), 0);

        let after = router.resolve("gpt2", false).await.unwrap();
        assert_eq!(after.kind(), ModelKind::Ollama);
    }

    #[tokio::test]
    async fn missing_checkpoint_is_unavailable_and_not_registered() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = Arc::new(RecordingLoader {
            missing: vec!["ghost/model"],
            ..Default::default()
        });
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec![]),
                fail_listing: false,
            },
            loader,
            tmp.path().to_path_buf(),
        );

        let err = router.resolve("ghost/model", false).await.unwrap_err();
        assert!(matches!(err, ServiceError::ModelUnavailable(_)));
        assert_eq!(router.loaded_count(), 0);
    }

    #[tokio::test]
    async fn adapter_with_missing_base_is_a_load_failure() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path(), "orphan", "ghost/base");
        let loader = Arc::new(RecordingLoader {
            missing: vec!["ghost/base"],
            ..Default::default()
        });
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec![]),
                fail_listing: false,
            },
            loader,
            tmp.path().to_path_buf(),
        );

        let err = router.resolve("orphan", false).await.unwrap_err();
        match err {
            ServiceError::ModelLoadFailed { model, cause } => {
                assert_eq!(model, "orphan");
                assert!(cause.contains("ghost/base"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn listing_swallows_runtime_failure() {
        let tmp = tempfile::tempdir().unwrap();
        write_adapter(tmp.path(), "support-bot", "gpt2");
        let loader = Arc::new(RecordingLoader::default());
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec!["llama3.2:1b"]),
                fail_listing: true,
            },
            loader,
            tmp.path().to_path_buf(),
        );
        router.resolve("gpt2", false).await.unwrap();

        let models = router.list_models().await;
        let kinds: Vec<_> = models.iter().map(|m| (m.name.as_str(), m.kind)).collect();
        assert_eq!(
            kinds,
            vec![("support-bot", ModelKind::Peft), ("gpt2", ModelKind::Hf)]
        );
    }

    #[tokio::test]
    async fn loaded_generator_produces_text() {
        let tmp = tempfile::tempdir().unwrap();
        let loader = Arc::new(RecordingLoader::default());
        let router = router(
            FakeRuntime {
                models: Mutex::new(vec![]),
                fail_listing: false,
            },
            loader,
            tmp.path().to_path_buf(),
        );
        let ModelHandle::Checkpoint(model) = router.resolve("gpt2", false).await.unwrap() else {
            panic!("expected checkpoint");
        };
        let params = SamplingParams {
            max_tokens: 4,
            temperature: 0.0,
            top_p: 1.0,
        };
        let completion = model.generator.generate("Hello", &params).unwrap();
        assert_eq!(completion.text, "abc");
    }
}
