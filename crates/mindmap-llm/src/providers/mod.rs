//! Per-endpoint provider adapters.
//!
//! Dashscope (`qwen`, `deepseek`) and Volcengine Ark (`ark-deepseek`,
//! `ark-kimi`, `ark-doubao`) both speak an OpenAI-compatible chat-completions
//! wire format, so one adapter (`openai_compatible`) serves every physical
//! model in this deployment; only the endpoint, API key, and model id differ.

pub mod openai_compatible;

use std::sync::Arc;

use mindmap_core::config::endpoints;
use mindmap_core::{CoreError, PhysicalModel, Result};

use crate::provider::ProviderClient;
use openai_compatible::OpenAiCompatibleClient;

/// Build the `ProviderClient` for a known physical model.
///
/// This is the one place that knows how physical model names map to
/// endpoints, mirroring the teacher's `create_backend(name, config)`
/// factory but specialized to this deployment's fixed provider set instead
/// of a user-configurable registry.
pub fn build_client(physical_model: &str) -> Result<Arc<dyn ProviderClient>> {
    let api_key_dashscope = std::env::var(mindmap_core::config::env_vars::DASHSCOPE_API_KEY)
        .unwrap_or_default();
    let api_key_volcengine = std::env::var(mindmap_core::config::env_vars::VOLCENGINE_API_KEY)
        .unwrap_or_default();

    let client: OpenAiCompatibleClient = match physical_model {
        "qwen" => OpenAiCompatibleClient::new(
            "qwen",
            endpoints::DASHSCOPE,
            "qwen-plus",
            api_key_dashscope,
        ),
        "deepseek" => OpenAiCompatibleClient::new(
            "deepseek",
            endpoints::DASHSCOPE,
            "deepseek-v3",
            api_key_dashscope,
        ),
        "ark-deepseek" => OpenAiCompatibleClient::new(
            "ark-deepseek",
            endpoints::VOLCENGINE_ARK,
            "deepseek-v3-250324",
            api_key_volcengine,
        ),
        "ark-kimi" => OpenAiCompatibleClient::new(
            "ark-kimi",
            endpoints::VOLCENGINE_ARK,
            "kimi-k2-250711",
            api_key_volcengine,
        ),
        "ark-doubao" => OpenAiCompatibleClient::new(
            "ark-doubao",
            endpoints::VOLCENGINE_ARK,
            "doubao-seed-1-6-250615",
            api_key_volcengine,
        ),
        other => return Err(CoreError::UnknownModel(other.to_string())),
    }?;

    Ok(Arc::new(client))
}

/// Fixed logical→physical candidate table (spec §4.5).
pub fn candidates_for(logical_model: &str) -> Vec<PhysicalModel> {
    match logical_model {
        "qwen" => vec!["qwen".to_string()],
        "kimi" => vec!["ark-kimi".to_string()],
        "doubao" => vec!["ark-doubao".to_string()],
        "deepseek" => vec!["deepseek".to_string(), "ark-deepseek".to_string()],
        other => vec![other.to_string()],
    }
}

/// All physical models this deployment ever routes to — used to build the
/// `ClientPool` at startup and to enumerate logical models for health checks.
pub fn all_physical_models() -> Vec<PhysicalModel> {
    vec![
        "qwen".to_string(),
        "deepseek".to_string(),
        "ark-deepseek".to_string(),
        "ark-kimi".to_string(),
        "ark-doubao".to_string(),
    ]
}

/// All logical models agents may address.
pub fn all_logical_models() -> Vec<String> {
    vec![
        "qwen".to_string(),
        "deepseek".to_string(),
        "kimi".to_string(),
        "doubao".to_string(),
    ]
}
