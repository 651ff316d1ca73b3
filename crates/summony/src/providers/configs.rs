use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;

pub const OPENAI_HOST: &str = "https://api.openai.com";
pub const XAI_HOST: &str = "https://api.x.ai";
pub const DEEPSEEK_HOST: &str = "https://api.deepseek.com";
pub const ANTHROPIC_HOST: &str = "https://api.anthropic.com";
pub const OLLAMA_HOST: &str = "http://localhost:11434";
pub const GEMINI_HOST: &str = "https://generativelanguage.googleapis.com";

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    Ollama(OllamaProviderConfig),
    Gemini(GeminiProviderConfig),
    Dummy(DummyProviderConfig),
}

pub trait EnvConfig {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self>
    where
        Self: Sized;

    /// Helper function to get environment variables with error handling
    fn get_env(key: &str, required: bool, default: Option<String>) -> Result<Option<String>> {
        match env::var(key) {
            Ok(value) => Ok(Some(value)),
            Err(env::VarError::NotPresent) if !required => Ok(default),
            Err(env::VarError::NotPresent) => Err(anyhow!(
                "Environment variable '{}' is required but not set.",
                key
            )),
            Err(e) => Err(e.into()),
        }
    }
}

/// Any endpoint speaking the OpenAI chat completions protocol
#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
}

impl OpenAiProviderConfig {
    pub fn new<S: Into<String>, T: Into<String>>(host: S, api_key: T) -> Self {
        Self {
            host: host.into(),
            api_key: api_key.into(),
        }
    }

    fn from_env_vars(key_var: &str, host_var: &str, default_host: &str) -> Result<Self> {
        let api_key = Self::get_env(key_var, true, None)?
            .ok_or_else(|| anyhow!("{} should be present", key_var))?;
        let host = Self::get_env(host_var, false, Some(default_host.to_string()))?
            .unwrap_or_else(|| default_host.to_string());
        Ok(Self::new(host, api_key))
    }

    pub fn xai_from_env() -> Result<Self> {
        Self::from_env_vars("XAI_API_KEY", "XAI_API_HOST", XAI_HOST)
    }

    pub fn deepseek_from_env() -> Result<Self> {
        Self::from_env_vars("DEEPSEEK_API_KEY", "DEEPSEEK_API_HOST", DEEPSEEK_HOST)
    }
}

impl EnvConfig for OpenAiProviderConfig {
    fn from_env() -> Result<Self> {
        Self::from_env_vars("OPENAI_API_KEY", "OPENAI_API_HOST", OPENAI_HOST)
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
}

impl EnvConfig for AnthropicProviderConfig {
    fn from_env() -> Result<Self> {
        let api_key = Self::get_env("ANTHROPIC_API_KEY", true, None)?
            .ok_or_else(|| anyhow!("Anthropic API key should be present"))?;
        let host = Self::get_env("ANTHROPIC_API_HOST", false, Some(ANTHROPIC_HOST.to_string()))?
            .unwrap_or_else(|| ANTHROPIC_HOST.to_string());
        Ok(Self { host, api_key })
    }
}

#[derive(Debug, Clone)]
pub struct OllamaProviderConfig {
    pub host: String,
    pub api_key: Option<String>,
}

impl EnvConfig for OllamaProviderConfig {
    fn from_env() -> Result<Self> {
        let host = Self::get_env("OLLAMA_HOST", false, Some(OLLAMA_HOST.to_string()))?
            .unwrap_or_else(|| OLLAMA_HOST.to_string());
        let api_key = Self::get_env("OLLAMA_API_KEY", false, None)?;
        Ok(Self { host, api_key })
    }
}

#[derive(Debug, Clone)]
pub struct GeminiProviderConfig {
    pub host: String,
    pub api_key: String,
}

impl EnvConfig for GeminiProviderConfig {
    fn from_env() -> Result<Self> {
        let api_key = Self::get_env("GEMINI_API_KEY", true, None)?
            .ok_or_else(|| anyhow!("Gemini API key should be present"))?;
        let host = Self::get_env("GEMINI_API_HOST", false, Some(GEMINI_HOST.to_string()))?
            .unwrap_or_else(|| GEMINI_HOST.to_string());
        Ok(Self { host, api_key })
    }
}

#[derive(Debug, Clone)]
pub struct DummyProviderConfig {
    /// Upper bound of the pause between streamed increments
    pub max_delay: Duration,
}

impl Default for DummyProviderConfig {
    fn default() -> Self {
        Self {
            max_delay: Duration::from_millis(200),
        }
    }
}

impl EnvConfig for DummyProviderConfig {
    fn from_env() -> Result<Self> {
        match Self::get_env("SUMMONY_DUMMY_DELAY_MS", false, None)? {
            Some(ms) => Ok(Self {
                max_delay: Duration::from_millis(ms.parse()?),
            }),
            None => Ok(Self::default()),
        }
    }
}
