use std::{
    env,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

#[cfg(feature = "tch-backend")]
use tch::Device;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub default_model: String,
    pub models_dir: PathBuf,
    pub ollama_url: String,
    pub max_tokens: usize,
    pub cache_ttl: Duration,
    pub max_input_tokens: usize,
    pub repetition_penalty: f32,
    /// Reported in `/health`; requests are not throttled against it.
    pub max_concurrent_requests: usize,
    pub runtime_timeout: Duration,
    pub checkpoint_module_file: String,
    /// Overrides the public hub, e.g. for a mirror.
    pub hub_endpoint: Option<String>,
    pub training_step: Duration,
    #[cfg(feature = "tch-backend")]
    pub device: Device,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let listen_addr = env::var("SERVER_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8000".into())
            .parse()
            .unwrap_or_else(|_| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8000));

        let default_model = env::var("DEFAULT_MODEL").unwrap_or_else(|_| "llama3.2:1b".to_string());
        let models_dir =
            PathBuf::from(env::var("MODELS_DIR").unwrap_or_else(|_| "/app/models".to_string()));
        let ollama_url =
            env::var("OLLAMA_URL").unwrap_or_else(|_| "http://ollama:11434".to_string());

        let max_tokens = parse_var("MAX_TOKENS").unwrap_or(512);
        let cache_ttl = parse_var("CACHE_TTL_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(300));
        let max_input_tokens = parse_var("MAX_INPUT_TOKENS").unwrap_or(2048);
        let repetition_penalty = parse_var("REPETITION_PENALTY").unwrap_or(1.1);
        let max_concurrent_requests = parse_var("MAX_CONCURRENT_REQUESTS").unwrap_or(10);
        let runtime_timeout = parse_var("RUNTIME_TIMEOUT_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(120));
        let checkpoint_module_file =
            env::var("CHECKPOINT_MODULE_FILE").unwrap_or_else(|_| "model.ts".to_string());
        let hub_endpoint = env::var("HF_ENDPOINT").ok().filter(|v| !v.trim().is_empty());
        let training_step = parse_var("TRAINING_STEP_SECS")
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(1));

        if max_tokens == 0 {
            anyhow::bail!("MAX_TOKENS must be at least 1");
        }

        #[cfg(feature = "tch-backend")]
        let device = {
            let raw = env::var("DEVICE").unwrap_or_else(|_| "cpu".into());
            parse_device(&raw)
        };

        Ok(Self {
            listen_addr,
            default_model,
            models_dir,
            ollama_url,
            max_tokens,
            cache_ttl,
            max_input_tokens,
            repetition_penalty,
            max_concurrent_requests,
            runtime_timeout,
            checkpoint_module_file,
            hub_endpoint,
            training_step,
            #[cfg(feature = "tch-backend")]
            device,
        })
    }

    /// Directory scanned for fine-tuned adapters, one sub-directory per model.
    pub fn adapters_dir(&self) -> PathBuf {
        self.models_dir.join("llm")
    }

    pub fn hub_cache_dir(&self) -> PathBuf {
        self.models_dir.join("hf")
    }

    pub fn device_label(&self) -> String {
        #[cfg(feature = "tch-backend")]
        {
            match self.device {
                Device::Cuda(idx) => format!("cuda:{idx}"),
                Device::Mps => "mps".to_string(),
                _ => "cpu".to_string(),
            }
        }
        #[cfg(not(feature = "tch-backend"))]
        {
            "cpu".to_string()
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8000),
            default_model: "llama3.2:1b".to_string(),
            models_dir: PathBuf::from("models"),
            ollama_url: "http://127.0.0.1:11434".to_string(),
            max_tokens: 512,
            cache_ttl: Duration::from_secs(300),
            max_input_tokens: 2048,
            repetition_penalty: 1.1,
            max_concurrent_requests: 10,
            runtime_timeout: Duration::from_secs(120),
            checkpoint_module_file: "model.ts".to_string(),
            hub_endpoint: None,
            training_step: Duration::from_secs(1),
            #[cfg(feature = "tch-backend")]
            device: Device::Cpu,
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(feature = "tch-backend")]
fn parse_device(raw: &str) -> Device {
    let lower = raw.to_lowercase();
    if lower == "cpu" {
        Device::Cpu
    } else if lower.starts_with("cuda") {
        let idx = lower
            .split(':')
            .nth(1)
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(0);
        if tch::Cuda::is_available() {
            Device::Cuda(idx)
        } else {
            Device::Cpu
        }
    } else {
        Device::cuda_if_available()
    }
}
