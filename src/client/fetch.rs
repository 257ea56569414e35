//! Model registry and download.
//!
//! A model identifier resolves to a file in the cache directory. Known
//! identifiers also carry a download URL so a missing file can be fetched
//! before the daemon is launched.

use async_trait::async_trait;
use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Models with a known download location.
const KNOWN_MODELS: &[(&str, &str, &str)] = &[(
    "llama-3.2-3b-instruct",
    "Llama-3.2-3B-Instruct-Q4_K_M.gguf",
    "https://huggingface.co/bartowski/Llama-3.2-3B-Instruct-GGUF/resolve/main/Llama-3.2-3B-Instruct-Q4_K_M.gguf",
)];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("model '{0}' is not in the cache and has no download source")]
    NoSource(String),

    #[error("download failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("download failed: HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("failed to write model file: {0}")]
    Io(#[from] std::io::Error),
}

/// A resolved model identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub id: String,
    pub filename: String,
    pub url: Option<String>,
}

impl ModelSpec {
    /// Resolve an identifier. Unknown identifiers name a local `.gguf` file.
    pub fn resolve(id: &str) -> Self {
        if let Some((known, filename, url)) = KNOWN_MODELS.iter().find(|(k, _, _)| *k == id) {
            return Self {
                id: known.to_string(),
                filename: filename.to_string(),
                url: Some(url.to_string()),
            };
        }

        let filename = if id.ends_with(".gguf") {
            id.to_string()
        } else {
            format!("{id}.gguf")
        };
        Self {
            id: id.to_string(),
            filename,
            url: None,
        }
    }

    /// Where this model lives inside `cache_dir`.
    pub fn path_in(&self, cache_dir: &Path) -> PathBuf {
        cache_dir.join(&self.filename)
    }
}

/// Makes a model file available at a destination path.
#[async_trait]
pub trait ModelFetcher: Send + Sync {
    async fn fetch(&self, spec: &ModelSpec, dest: &Path) -> Result<(), FetchError>;
}

/// Downloads over HTTP with a progress bar on stderr.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }
}

fn progress_bar(total: Option<u64>) -> ProgressBar {
    match total {
        Some(size) => {
            let pb = ProgressBar::new(size);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
                .map(|s| s.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb
        }
        None => {
            let pb = ProgressBar::new_spinner();
            let style = ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {bytes} downloaded")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            pb.set_style(style);
            pb
        }
    }
}

fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl ModelFetcher for HttpFetcher {
    async fn fetch(&self, spec: &ModelSpec, dest: &Path) -> Result<(), FetchError> {
        let url = spec
            .url
            .as_deref()
            .ok_or_else(|| FetchError::NoSource(spec.id.clone()))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        eprintln!("Downloading model '{}' to {}", spec.id, dest.display());
        info!(model = %spec.id, url, "Downloading model");

        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let pb = progress_bar(response.content_length());
        let part = partial_path(dest);
        let mut file = tokio::fs::File::create(&part).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    pb.abandon();
                    drop(file);
                    let _ = tokio::fs::remove_file(&part).await;
                    return Err(e.into());
                }
            };
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }

        file.flush().await?;
        drop(file);
        tokio::fs::rename(&part, dest).await?;
        pb.finish_with_message("Download complete");

        debug!(bytes = downloaded, path = %dest.display(), "Model downloaded");
        Ok(())
    }
}
