use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::llm::model::ModelParams;
use crate::llm::session::{ContextParams, GenerationOptions};
use crate::llm::tokenizer::Token;

/// Default knobs for generations started from the command line
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Prefix text prompts with BOS
    pub add_bos: bool,
    /// Maximum number of tokens to generate, 256 unless a config layer sets another bound
    pub max_tokens: Option<usize>,
    /// Wall-clock budget per generation in milliseconds
    pub timeout_ms: Option<u64>,
    /// Token ids that end generation like EOS
    pub stop_tokens: Vec<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            add_bos: true,
            max_tokens: Some(256),
            timeout_ms: None,
            stop_tokens: Vec::new(),
        }
    }
}

impl GenerationConfig {
    pub fn to_options(&self) -> GenerationOptions {
        GenerationOptions {
            add_bos: self.add_bos,
            max_tokens: self.max_tokens,
            stop_tokens: self.stop_tokens.iter().copied().map(Token).collect(),
            timeout: self.timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Configuration for application logging
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Optional log file, rotated daily
    pub file: Option<PathBuf>,
    /// Emit JSON lines instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            json: false,
        }
    }
}

/// Main settings struct that contains all configuration
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub model: ModelParams,
    pub context: ContextParams,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

const ENV_PREFIX: &str = "LLM_SESSION";

impl Settings {
    /// Loads settings from `./config`, in the following order of precedence
    /// (highest to lowest):
    /// 1. Environment variables prefixed with `LLM_SESSION_`, nested with `__`
    ///    (e.g. `LLM_SESSION_CONTEXT__N_CTX=2048`)
    /// 2. Local config file (local.toml) if present
    /// 3. Default config file (default.toml)
    pub fn new() -> Result<Self, ConfigError> {
        let config_dir = std::env::current_dir()
            .map_err(|e| ConfigError::Message(format!("Failed to get current directory: {}", e)))?
            .join("config");
        Self::from_dir(&config_dir)
    }

    /// Same layering as [`Settings::new`] rooted at `config_dir`.
    pub fn from_dir(config_dir: &Path) -> Result<Self, ConfigError> {
        Self::load(config_dir, None)
    }

    fn load(config_dir: &Path, env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        let default_config = config_dir.join("default.toml");
        if !default_config.exists() {
            return Err(ConfigError::Message(format!(
                "Default configuration file not found at: {}",
                default_config.display()
            )));
        }
        let local_config = config_dir.join("local.toml");

        let settings = Config::builder()
            .add_source(File::from(default_config))
            .add_source(File::from(local_config).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.to_lowercase().as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid logging level: {}. Must be one of: error, warn, info, debug, trace",
                    self.logging.level
                )))
            }
        }

        if self.generation.max_tokens == Some(0) {
            return Err(ConfigError::Message("max_tokens must be greater than 0".to_string()));
        }

        self.model
            .validate()
            .map_err(|e| ConfigError::Message(format!("[model] {}", e)))?;
        self.context
            .validate()
            .map_err(|e| ConfigError::Message(format!("[context] {}", e)))?;

        if let Some(parent) = self.logging.file.as_deref().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ConfigError::Message(format!("Failed to create log directory at {}: {}", parent.display(), e))
                })?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::session::RopeScaling;
    use std::fs;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn missing_default_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = Settings::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("default.toml"));
    }

    #[test]
    fn empty_default_file_yields_defaults() {
        let dir = tempdir().unwrap();
        write(dir.path(), "default.toml", "");
        let settings = Settings::from_dir(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.generation.max_tokens, Some(256));
        assert_eq!(settings.generation.to_options().max_tokens, Some(256));
    }

    #[test]
    fn local_file_overrides_default() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "default.toml",
            "[context]\nn_ctx = 1024\nn_batch = 256\n\n[generation]\nmax_tokens = 32\n",
        );
        write(dir.path(), "local.toml", "[context]\nn_ctx = 4096\nrope_scaling_type = \"yarn\"\n");

        let settings = Settings::from_dir(dir.path()).unwrap();
        assert_eq!(settings.context.n_ctx, 4096);
        assert_eq!(settings.context.n_batch, 256);
        assert_eq!(settings.context.rope_scaling_type, RopeScaling::Yarn);
        assert_eq!(settings.generation.max_tokens, Some(32));
    }

    #[test]
    fn environment_overrides_files() {
        let dir = tempdir().unwrap();
        write(dir.path(), "default.toml", "[model]\ngpu_layers = 0\n");
        let env = HashMap::from([
            ("LLM_SESSION_MODEL__GPU_LAYERS".to_string(), "12".to_string()),
            ("LLM_SESSION_LOGGING__LEVEL".to_string(), "debug".to_string()),
        ]);

        let settings = Settings::load(dir.path(), Some(env)).unwrap();
        assert_eq!(settings.model.gpu_layers, 12);
        assert_eq!(settings.logging.level, "debug");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let dir = tempdir().unwrap();
        write(dir.path(), "default.toml", "[logging]\nlevel = \"loud\"\n");
        assert!(Settings::from_dir(dir.path()).is_err());

        write(dir.path(), "default.toml", "[context]\nn_ctx = 0\n");
        let err = Settings::from_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("n_ctx"));

        write(dir.path(), "default.toml", "[generation]\nmax_tokens = 0\n");
        assert!(Settings::from_dir(dir.path()).is_err());
    }

    #[test]
    fn generation_config_converts_to_options() {
        let config = GenerationConfig {
            add_bos: false,
            max_tokens: Some(8),
            timeout_ms: Some(1500),
            stop_tokens: vec![13, 2],
        };
        let options = config.to_options();
        assert!(!options.add_bos);
        assert_eq!(options.max_tokens, Some(8));
        assert_eq!(options.timeout, Some(Duration::from_millis(1500)));
        assert!(options.stop_tokens.contains(&Token(13)));
        assert_eq!(options.stop_tokens.len(), 2);
    }
}
