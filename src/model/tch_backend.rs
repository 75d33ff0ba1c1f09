use std::collections::HashMap;
use std::path::Path;

use tch::{CModule, Device, IValue, Kind, Tensor, no_grad};

use crate::{
    error::ServiceError,
    model::{adapter::AdapterSource, generation::LogitsModel},
};

pub struct TorchScriptModel {
    name: String,
    device: Device,
    module: CModule,
}

impl TorchScriptModel {
    pub fn load(name: &str, module_path: &Path, device: Device) -> Result<Self, ServiceError> {
        let mut module = CModule::load_on_device(module_path, device)
            .map_err(|e| ServiceError::load_failed(name, e))?;
        module.set_eval();
        Ok(Self {
            name: name.to_string(),
            device,
            module,
        })
    }
}

impl LogitsModel for TorchScriptModel {
    fn next_token_logits(&mut self, input_ids: &[u32]) -> Result<Vec<f32>, ServiceError> {
        let ids: Vec<i64> = input_ids.iter().map(|&id| id as i64).collect();
        no_grad(|| {
            let input = Tensor::from_slice(&ids)
                .reshape([1, ids.len() as i64])
                .to(self.device);
            let output = self
                .module
                .forward_is(&[IValue::Tensor(input)])
                .map_err(|e| ServiceError::GenerationFailed(e.to_string()))?;

            // traced causal LMs return either the logits or (logits, past)
            let logits = match output {
                IValue::Tensor(t) => t,
                IValue::Tuple(ref items) if !items.is_empty() => match &items[0] {
                    IValue::Tensor(t) => t.shallow_clone(),
                    _ => {
                        return Err(ServiceError::GenerationFailed(
                            "expected tensor as first tuple element".into(),
                        ));
                    }
                },
                _ => {
                    return Err(ServiceError::GenerationFailed(
                        "unexpected model output format".into(),
                    ));
                }
            };

            // [1, seq_len, vocab] -> [vocab]
            let last = logits
                .select(1, -1)
                .squeeze()
                .to_kind(Kind::Float)
                .to_device(Device::Cpu);
            Vec::<f32>::try_from(&last).map_err(|e| ServiceError::GenerationFailed(e.to_string()))
        })
    }

    fn apply_adapter(&mut self, adapter: &AdapterSource) -> Result<(), ServiceError> {
        let load_err = |cause: String| ServiceError::load_failed(&adapter.name, cause);

        let weights_path = adapter.weights_path();
        let tensors = Tensor::read_safetensors(&weights_path)
            .map_err(|e| load_err(format!("{}: {e}", weights_path.display())))?;
        let tensors: HashMap<String, Tensor> = tensors.into_iter().collect();

        let params: HashMap<String, Tensor> = self
            .module
            .named_parameters()
            .map_err(|e| load_err(e.to_string()))?
            .into_iter()
            .collect();

        let scaling = adapter.config.scaling();
        let mut merged = 0usize;
        no_grad(|| -> Result<(), ServiceError> {
            for (key, lora_a) in &tensors {
                let Some(prefix) = key.strip_suffix(".lora_A.weight") else {
                    continue;
                };
                let lora_b = tensors
                    .get(&format!("{prefix}.lora_B.weight"))
                    .ok_or_else(|| load_err(format!("missing lora_B for {prefix}")))?;
                let target = target_parameter(prefix);
                let param = params
                    .get(&target)
                    .ok_or_else(|| load_err(format!("base model has no parameter {target}")))?;

                let mut delta = lora_b
                    .to_device(param.device())
                    .to_kind(Kind::Float)
                    .matmul(&lora_a.to_device(param.device()).to_kind(Kind::Float))
                    * scaling;
                if adapter.config.fan_in_fan_out {
                    delta = delta.transpose(0, 1);
                }
                let mut param = param.shallow_clone();
                param
                    .f_add_(&delta.to_kind(param.kind()))
                    .map_err(|e| load_err(format!("{target}: {e}")))?;
                merged += 1;
            }
            Ok(())
        })?;

        if merged == 0 {
            return Err(load_err("adapter contains no LoRA weights".into()));
        }
        tracing::info!(
            model = %self.name,
            adapter = %adapter.name,
            merged,
            "merged LoRA weights"
        );
        Ok(())
    }
}

/// `base_model.model.transformer.h.0.attn.c_attn` -> `transformer.h.0.attn.c_attn.weight`
fn target_parameter(lora_prefix: &str) -> String {
    let module = lora_prefix
        .strip_prefix("base_model.model.")
        .unwrap_or(lora_prefix);
    format!("{module}.weight")
}
