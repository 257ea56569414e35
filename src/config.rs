//! Configuration management for llx.
//!
//! Configuration is loaded from `~/.config/llx/config.toml`. Every field has
//! a default, so the file is optional.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// Well-known endpoint shared by every client and the daemon on this host.
pub const SOCKET_PATH: &str = "/tmp/llx.sock";

/// Model identifier used when neither the CLI nor the config names one.
pub const DEFAULT_MODEL_ID: &str = "llama-3.2-3b-instruct";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Which model the client asks the daemon to load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_id")]
    pub id: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            id: default_model_id(),
        }
    }
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

/// Model engine resources, applied by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_context_size")]
    pub context_size: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Layers offloaded to the GPU when the engine supports it.
    #[serde(default = "default_gpu_layers")]
    pub gpu_layers: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            context_size: default_context_size(),
            batch_size: default_batch_size(),
            threads: default_threads(),
            gpu_layers: default_gpu_layers(),
        }
    }
}

fn default_context_size() -> u32 {
    2048
}

fn default_batch_size() -> u32 {
    512
}

fn default_threads() -> u32 {
    8
}

fn default_gpu_layers() -> u32 {
    99
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("llx"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, using defaults if not found.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }
}

/// Filesystem locations for the model cache and the daemon log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    cache_dir: PathBuf,
}

impl Paths {
    /// Resolve paths from `$HOME`, falling back to the working directory.
    pub fn discover() -> Self {
        let home = home_from_env(std::env::var_os("HOME"));
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self::from_home(home, cwd)
    }

    /// Cache under `<home>/.cache/llx`, or directly in `cwd` without a home.
    pub fn from_home(home: Option<PathBuf>, cwd: PathBuf) -> Self {
        let cache_dir = match home {
            Some(home) => home.join(".cache").join("llx"),
            None => cwd,
        };
        Self { cache_dir }
    }

    /// Use an explicit cache directory.
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Path of a model file inside the cache.
    pub fn model_path(&self, filename: &str) -> PathBuf {
        self.cache_dir.join(filename)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.cache_dir.join("logs")
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.log_dir().join("llxd.log")
    }
}

/// Only the variable counts; an unset or empty `$HOME` means no home.
fn home_from_env(home: Option<OsString>) -> Option<PathBuf> {
    home.filter(|h| !h.is_empty()).map(PathBuf::from)
}
