pub mod cache;
pub mod config;
pub mod error;
pub mod ledger;
pub mod model;
pub mod runtime;
pub mod sampling;
pub mod server;
pub mod service;
pub mod training;

pub use cache::{MemoryCache, ResponseCache};
pub use config::AppConfig;
pub use error::ServiceError;
pub use ledger::{Ledger, MemoryLedger};
pub use model::{GenerationRequest, GenerationResult, ModelRouter};
pub use runtime::{LocalRuntime, OllamaClient};
pub use server::{AppState, build_router};
