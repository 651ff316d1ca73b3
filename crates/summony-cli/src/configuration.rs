use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Base parameters every agent starts with
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Where per-agent model call logs go; no logging when unset
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

impl Settings {
    /// Load settings from the user's config file (if any) and `SUMMONY_*` variables
    pub fn new() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Like [`Settings::new`], reading `path` instead of the default file.
    ///
    /// An explicit path must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = match path {
            Some(path) => Some(File::from(path).required(true)),
            None => default_config_path().map(|path| File::from(path).required(false)),
        };

        let mut builder = Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }

        let config = builder
            // Environment variables override the config file
            .add_source(
                Environment::with_prefix("SUMMONY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("models")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Self = config.try_deserialize()?;
        tracing::debug!(models = ?settings.models, "loaded settings");
        Ok(settings)
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("summony").join("config.toml"))
}

fn default_models() -> Vec<String> {
    vec!["dummy".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use std::fs;
    use tempfile::tempdir;

    fn clean_env() {
        for (key, _) in env::vars() {
            if key.starts_with("SUMMONY_") {
                env::remove_var(&key);
            }
        }
    }

    #[test]
    #[serial]
    fn test_default_settings() {
        clean_env();
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.models, vec!["dummy".to_string()]);
        assert_eq!(settings.system_prompt, None);
        assert!(settings.params.is_empty());
        assert_eq!(settings.logs_dir, None);
    }

    #[test]
    #[serial]
    fn test_file_settings() {
        clean_env();
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
models = ["gpt-4o", "claude-sonnet"]
system_prompt = "Be brief."
logs_dir = "/tmp/summony-logs"

[params]
temperature = 0.7
max_tokens = 512
"#,
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.models, vec!["gpt-4o", "claude-sonnet"]);
        assert_eq!(settings.system_prompt.as_deref(), Some("Be brief."));
        assert_eq!(settings.params["temperature"], Value::from(0.7));
        assert_eq!(settings.params["max_tokens"], Value::from(512));
        assert_eq!(settings.logs_dir, Some(PathBuf::from("/tmp/summony-logs")));
    }

    #[test]
    #[serial]
    fn test_environment_override() {
        clean_env();
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "models = [\"gpt-4o\"]\nsystem_prompt = \"Be brief.\"\n").unwrap();

        env::set_var("SUMMONY_MODELS", "dummy,ollama::llama3");
        env::set_var("SUMMONY_SYSTEM_PROMPT", "Be thorough.");
        env::set_var("SUMMONY_PARAMS__TEMPERATURE", "0.3");

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.models, vec!["dummy", "ollama::llama3"]);
        assert_eq!(settings.system_prompt.as_deref(), Some("Be thorough."));
        assert_eq!(settings.params["temperature"], Value::from(0.3));

        // Clean up
        env::remove_var("SUMMONY_MODELS");
        env::remove_var("SUMMONY_SYSTEM_PROMPT");
        env::remove_var("SUMMONY_PARAMS__TEMPERATURE");
    }

    #[test]
    #[serial]
    fn test_missing_explicit_file() {
        clean_env();
        let dir = tempdir().unwrap();
        let result = Settings::load(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }
}
