#![allow(dead_code)]

use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokenizers::Tokenizer;

use model_gateway::{
    AppConfig, AppState, Ledger, MemoryCache, MemoryLedger, ModelRouter, ServiceError,
    build_router,
    ledger::{RequestLog, TrainingJob},
    model::{
        Checkpoint, GenerationSettings, LogitsModel, ModelLoader, ValidatedRequest,
        adapter::AdapterSource,
    },
    runtime::{LocalRuntime, RuntimeGeneration, RuntimeModel},
};

const VOCAB: [&str; 6] = ["[UNK]", "<eos>", "Hello", "abc", "STOP", "def"];

pub fn word_tokenizer() -> Tokenizer {
    let vocab = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| format!("\"{word}\":{id}"))
        .collect::<Vec<_>>()
        .join(",");
    let json = format!(
        r#"{{"version":"1.0","truncation":null,"padding":null,
"added_tokens":[{{"id":1,"content":"<eos>","single_word":false,"lstrip":false,"rstrip":false,"normalized":false,"special":true}}],
"normalizer":null,"pre_tokenizer":{{"type":"Whitespace"}},"post_processor":null,"decoder":null,
"model":{{"type":"WordLevel","vocab":{{{vocab}}},"unk_token":"[UNK]"}}}}"#
    );
    Tokenizer::from_str(&json).unwrap()
}

/// Always emits "abc STOP def" and then `<eos>`.
struct ScriptedModel {
    step: usize,
}

impl LogitsModel for ScriptedModel {
    fn next_token_logits(&mut self, _input_ids: &[u32]) -> Result<Vec<f32>, ServiceError> {
        let script = [3usize, 4, 5];
        let next = script.get(self.step).copied().unwrap_or(1);
        self.step += 1;
        let mut logits = vec![0.0; VOCAB.len()];
        logits[next] = 60.0;
        Ok(logits)
    }

    fn apply_adapter(&mut self, _adapter: &AdapterSource) -> Result<(), ServiceError> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    pub models: Vec<String>,
    pub fail_listing: bool,
    pub generations: AtomicUsize,
}

impl FakeRuntime {
    pub fn with_models(models: &[&str]) -> Self {
        Self {
            models: models.iter().map(|m| m.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn generations(&self) -> usize {
        self.generations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalRuntime for FakeRuntime {
    async fn list_models(&self) -> Result<Vec<RuntimeModel>, ServiceError> {
        if self.fail_listing {
            return Err(ServiceError::Other("runtime unreachable".into()));
        }
        Ok(self
            .models
            .iter()
            .map(|name| RuntimeModel {
                name: name.clone(),
                size: Some(1_321_098_329),
                modified_at: None,
            })
            .collect())
    }

    async fn generate(&self, request: &ValidatedRequest) -> Result<RuntimeGeneration, ServiceError> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        Ok(RuntimeGeneration {
            text: format!("echo: {}", request.prompt),
            eval_count: Some(3),
        })
    }
}

/// Serves "tiny" from memory; every other name is missing from the hub.
#[derive(Default)]
pub struct FakeLoader {
    pub loads: AtomicUsize,
}

#[async_trait]
impl ModelLoader for FakeLoader {
    async fn load_checkpoint(&self, name: &str) -> Result<Checkpoint, ServiceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if name != "tiny" {
            return Err(ServiceError::ModelUnavailable(name.to_string()));
        }
        Ok(Checkpoint {
            source: name.to_string(),
            tokenizer: Arc::new(word_tokenizer()),
            model: Box::new(ScriptedModel { step: 0 }),
        })
    }
}

pub struct BrokenLedger;

#[async_trait]
impl Ledger for BrokenLedger {
    async fn record_request(&self, _entry: RequestLog) -> Result<(), ServiceError> {
        Err(ServiceError::Ledger("database is down".into()))
    }

    async fn requests(&self) -> Result<Vec<RequestLog>, ServiceError> {
        Err(ServiceError::Ledger("database is down".into()))
    }

    async fn save_job(&self, _job: TrainingJob) -> Result<(), ServiceError> {
        Err(ServiceError::Ledger("database is down".into()))
    }

    async fn job(&self, _id: &str) -> Result<Option<TrainingJob>, ServiceError> {
        Err(ServiceError::Ledger("database is down".into()))
    }
}

pub struct TestApp {
    pub base_url: String,
    pub client: reqwest::Client,
    pub runtime: Arc<FakeRuntime>,
    pub loader: Arc<FakeLoader>,
    pub ledger: Arc<dyn Ledger>,
    pub adapters_dir: PathBuf,
    _models_dir: tempfile::TempDir,
}

impl TestApp {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Polls the ledger until `count` request logs exist.
    pub async fn wait_for_logs(&self, count: usize) -> Vec<RequestLog> {
        for _ in 0..200 {
            let logs = self.ledger.requests().await.unwrap();
            if logs.len() >= count {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("ledger never reached {count} request logs");
    }
}

pub async fn spawn_app(runtime: FakeRuntime) -> TestApp {
    spawn_app_with_ledger(runtime, Arc::new(MemoryLedger::new())).await
}

pub async fn spawn_app_with_ledger(runtime: FakeRuntime, ledger: Arc<dyn Ledger>) -> TestApp {
    let models_dir = tempfile::tempdir().unwrap();
    let config = AppConfig {
        models_dir: models_dir.path().to_path_buf(),
        default_model: "llama3.2:1b".to_string(),
        training_step: Duration::from_millis(5),
        ..AppConfig::default()
    };
    let adapters_dir = config.adapters_dir();
    std::fs::create_dir_all(&adapters_dir).unwrap();

    let runtime = Arc::new(runtime);
    let loader = Arc::new(FakeLoader::default());
    let router = Arc::new(ModelRouter::new(
        runtime.clone(),
        loader.clone(),
        adapters_dir.clone(),
        GenerationSettings {
            max_input_tokens: config.max_input_tokens,
            repetition_penalty: config.repetition_penalty,
        },
    ));
    let state = AppState::new(
        Arc::new(config),
        router,
        Arc::new(MemoryCache::new()),
        ledger.clone(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });

    TestApp {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        runtime,
        loader,
        ledger,
        adapters_dir,
        _models_dir: models_dir,
    }
}
