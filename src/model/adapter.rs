use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::ServiceError;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// The subset of a PEFT `adapter_config.json` the gateway needs.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub base_model_name_or_path: String,
    #[serde(default)]
    pub peft_type: Option<String>,
    #[serde(default = "default_rank")]
    pub r: usize,
    #[serde(default = "default_alpha")]
    pub lora_alpha: f64,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
}

fn default_rank() -> usize {
    8
}

fn default_alpha() -> f64 {
    8.0
}

impl AdapterConfig {
    pub fn scaling(&self) -> f64 {
        let rank = self.r.max(1) as f64;
        if self.use_rslora {
            self.lora_alpha / rank.sqrt()
        } else {
            self.lora_alpha / rank
        }
    }
}

/// An adapter directory on disk together with its parsed configuration.
#[derive(Debug, Clone)]
pub struct AdapterSource {
    pub name: String,
    pub dir: PathBuf,
    pub config: AdapterConfig,
}

impl AdapterSource {
    pub fn weights_path(&self) -> PathBuf {
        self.dir.join(ADAPTER_WEIGHTS_FILE)
    }
}

/// Looks for `<root>/<name>/adapter_config.json`.
///
/// `Ok(None)` means no adapter of that name exists; a present but unreadable
/// config is a load failure.
pub fn find_adapter(root: &Path, name: &str) -> Result<Option<AdapterSource>, ServiceError> {
    if !is_plain_dir_name(name) {
        return Ok(None);
    }
    let dir = root.join(name);
    let config_path = dir.join(ADAPTER_CONFIG_FILE);
    if !dir.is_dir() || !config_path.is_file() {
        return Ok(None);
    }

    let raw = fs::read_to_string(&config_path).map_err(|e| ServiceError::load_failed(name, e))?;
    let config: AdapterConfig = serde_json::from_str(&raw).map_err(|e| {
        ServiceError::load_failed(name, format!("invalid {ADAPTER_CONFIG_FILE}: {e}"))
    })?;
    if let Some(kind) = config.peft_type.as_deref() {
        if !kind.eq_ignore_ascii_case("LORA") {
            return Err(ServiceError::load_failed(
                name,
                format!("unsupported peft_type {kind}, only LORA adapters can be merged"),
            ));
        }
    }

    Ok(Some(AdapterSource {
        name: name.to_string(),
        dir,
        config,
    }))
}

// Names containing separators would escape the adapters root.
fn is_plain_dir_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
}

#[derive(Debug, Clone)]
pub struct AdapterEntry {
    pub name: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Every sub-directory of `root` holding an adapter config. A missing root
/// yields an empty list; unreadable entries are skipped.
pub fn scan_adapters(root: &Path) -> Vec<AdapterEntry> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut adapters = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() || !path.join(ADAPTER_CONFIG_FILE).is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(adapter = name, error = %err, "failed to stat adapter directory");
                continue;
            }
        };
        let created = metadata
            .created()
            .or_else(|_| metadata.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        adapters.push(AdapterEntry {
            name: name.to_string(),
            size_bytes: dir_size(&path),
            created_at: created,
        });
    }
    adapters.sort_by(|a, b| a.name.cmp(&b.name));
    adapters
}

fn dir_size(path: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| match entry.metadata() {
            Ok(meta) if meta.is_dir() => dir_size(&entry.path()),
            Ok(meta) => meta.len(),
            Err(_) => 0,
        })
        .sum()
}
