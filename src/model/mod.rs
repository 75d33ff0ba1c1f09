pub mod adapter;
mod generation;
pub mod hub;
mod loader;
mod router;
mod types;

#[cfg(feature = "tch-backend")]
pub mod tch_backend;

pub use generation::{
    CausalGenerator, Checkpoint, Completion, GenerationSettings, LogitsModel, TextGenerator,
};
pub use loader::{HubModelLoader, ModelLoader};
pub use router::{LoadedModel, ModelHandle, ModelRouter};
pub use types::{
    GenerationRequest, GenerationResult, ModelInfo, ModelKind, SamplingParams, ValidatedRequest,
    format_size,
};

#[cfg(test)]
pub(crate) use generation::testing;
