use std::sync::Arc;

use anyhow::Result;
use strum_macros::{Display, EnumIter, EnumString};

use super::{
    anthropic::AnthropicProvider,
    base::Provider,
    configs::{
        AnthropicProviderConfig, DummyProviderConfig, EnvConfig, GeminiProviderConfig,
        OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig,
    },
    dummy::DummyProvider,
    gemini::GeminiProvider,
    ollama::{OllamaProvider, OLLAMA_MODEL_PREFIX},
    openai::OpenAiProvider,
};
use crate::errors::{AgentError, AgentResult};

/// Agent kinds, as written in snapshot descriptors
#[derive(EnumIter, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Anthropic,
    Ollama,
    Xai,
    DeepSeek,
    Gemini,
    Dummy,
}

impl ProviderType {
    /// Default kind for a model identifier, judged by its prefix
    pub fn for_model(model: &str) -> AgentResult<Self> {
        let kind = if model.starts_with(OLLAMA_MODEL_PREFIX) {
            ProviderType::Ollama
        } else if model.starts_with("dummy") {
            ProviderType::Dummy
        } else if model.starts_with("gpt") || model.starts_with("o1") {
            ProviderType::OpenAi
        } else if model.starts_with("claude") {
            ProviderType::Anthropic
        } else if model.starts_with("grok") {
            ProviderType::Xai
        } else if model.starts_with("deepseek") {
            ProviderType::DeepSeek
        } else if model.starts_with("gemini") {
            ProviderType::Gemini
        } else {
            return Err(AgentError::UnknownAgentKind(format!(
                "no agent kind serves model '{}'",
                model
            )));
        };
        Ok(kind)
    }

    /// Parse a kind name, as stored in snapshots
    pub fn from_kind(kind: &str) -> AgentResult<Self> {
        kind.parse()
            .map_err(|_| AgentError::UnknownAgentKind(kind.to_string()))
    }

    /// Provider configuration read from the environment
    pub fn config_from_env(&self) -> Result<ProviderConfig> {
        Ok(match self {
            ProviderType::OpenAi => ProviderConfig::OpenAi(OpenAiProviderConfig::from_env()?),
            ProviderType::Xai => ProviderConfig::OpenAi(OpenAiProviderConfig::xai_from_env()?),
            ProviderType::DeepSeek => {
                ProviderConfig::OpenAi(OpenAiProviderConfig::deepseek_from_env()?)
            }
            ProviderType::Anthropic => {
                ProviderConfig::Anthropic(AnthropicProviderConfig::from_env()?)
            }
            ProviderType::Ollama => ProviderConfig::Ollama(OllamaProviderConfig::from_env()?),
            ProviderType::Gemini => ProviderConfig::Gemini(GeminiProviderConfig::from_env()?),
            ProviderType::Dummy => ProviderConfig::Dummy(DummyProviderConfig::from_env()?),
        })
    }
}

pub fn get_provider(config: ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config {
        ProviderConfig::OpenAi(openai_config) => Ok(Arc::new(OpenAiProvider::new(openai_config)?)),
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Arc::new(AnthropicProvider::new(anthropic_config)?))
        }
        ProviderConfig::Ollama(ollama_config) => Ok(Arc::new(OllamaProvider::new(ollama_config)?)),
        ProviderConfig::Gemini(gemini_config) => Ok(Arc::new(GeminiProvider::new(gemini_config)?)),
        ProviderConfig::Dummy(dummy_config) => Ok(Arc::new(DummyProvider::new(dummy_config))),
    }
}

/// Build a provider of the given kind from environment configuration
pub fn provider_for_kind(kind: ProviderType) -> Result<Arc<dyn Provider>> {
    get_provider(kind.config_from_env()?)
}
