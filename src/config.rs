//! Runtime configuration for inference-session.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! Missing files fall back to defaults.

use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::inference::backend::GenerationParams;
use crate::inference::llama_ffi::{ContextParams, MAX_CONTEXT_SIZE};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "inference-session", about = "On-device LLM chat session server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub json_logs: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Model discovery and native context settings.
    pub models: ModelsConfig,

    /// Default sampling parameters for new chats.
    pub generation: GenerationConfig,

    /// Chat persistence.
    pub store: StoreConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,

    /// Timeout for non-streaming requests, in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            request_timeout_secs: 300,
        }
    }
}

/// Where models live and how their contexts are sized.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Directory scanned for `*.gguf` files.
    pub dir: PathBuf,

    /// Context size in tokens (capped by the model's training context).
    pub context_size: u32,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("models"),
            context_size: MAX_CONTEXT_SIZE,
        }
    }
}

impl ModelsConfig {
    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            n_ctx: self.context_size,
            ..ContextParams::default()
        }
    }
}

/// Default sampling parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub min_p: f32,
    pub temperature: f32,
    pub store_chats: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        let params = GenerationParams::default();
        Self {
            min_p: params.min_p,
            temperature: params.temperature,
            store_chats: params.store_chats,
        }
    }
}

impl GenerationConfig {
    pub fn params(&self) -> GenerationParams {
        GenerationParams {
            min_p: self.min_p,
            temperature: self.temperature,
            store_chats: self.store_chats,
        }
    }
}

/// Chat persistence settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file holding chats and turns; `None` keeps them in memory only.
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: Some(PathBuf::from("data/chats.json")),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.models.context_size, MAX_CONTEXT_SIZE);
        assert!(cfg.generation.store_chats);
        assert_eq!(cfg.generation.params(), GenerationParams::default());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "generation": { "temperature": 0.3 }, "store": { "path": null } }"#)
                .unwrap();
        assert_eq!(cfg.generation.temperature, 0.3);
        assert_eq!(cfg.generation.min_p, GenerationParams::default().min_p);
        assert!(cfg.store.path.is_none());
        assert_eq!(cfg.server.listen, "127.0.0.1:8080");
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let cfg = Config::load(std::path::Path::new("/nonexistent/config.json")).unwrap();
        assert_eq!(cfg.models.dir, PathBuf::from("models"));
    }
}
