//! Configuration management
//!
//! All configuration types are exported from this module.

pub mod prompts;
pub mod store;

pub use store::{
    BackendConfig, DecisionConfig, ModelConfig, PlannerConfig, PromptsConfig, SessionsConfig,
    BASE_URL_ENV, MODEL_PATH_ENV,
};
