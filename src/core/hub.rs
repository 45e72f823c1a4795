//! Pretrained model repository client
//!
//! Resolves `(repo_id, file)` to a local path, downloading from a
//! Hugging Face compatible hub when the file is not already on disk.

use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::core::config::HubConfig;
use crate::core::errors::{Result, TranslationError};

/// Model repository backed by a local directory, a download cache and the hub
#[derive(Debug, Clone)]
pub struct ModelRepository {
    client: reqwest::Client,
    config: HubConfig,
    show_progress: bool,
}

impl ModelRepository {
    /// Create a new repository client
    pub fn new(config: HubConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .build()?;

        Ok(Self {
            client,
            config,
            show_progress: false,
        })
    }

    /// Draw a progress bar for each download
    pub fn with_progress(mut self, show_progress: bool) -> Self {
        self.show_progress = show_progress;
        self
    }

    /// Organisation that publishes the models
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Path a file is cached at, whether or not it exists yet
    pub fn cache_path(&self, repo_id: &str, file: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(repo_id.replace('/', "--"))
            .join(&self.config.revision)
            .join(file)
    }

    fn local_path(&self, repo_id: &str, file: &str) -> Option<PathBuf> {
        let models_dir = self.config.models_dir.as_ref()?;
        let model_name = repo_id.rsplit('/').next().unwrap_or(repo_id);
        let path = models_dir.join(model_name).join(file);
        path.is_file().then_some(path)
    }

    fn file_url(&self, repo_id: &str, file: &str) -> String {
        format!(
            "{}/{}/resolve/{}/{}",
            self.config.endpoint.trim_end_matches('/'),
            repo_id,
            self.config.revision,
            file
        )
    }

    /// Resolve a repository file to a local path, downloading it if needed
    pub async fn resolve(&self, repo_id: &str, file: &str) -> Result<PathBuf> {
        if let Some(path) = self.local_path(repo_id, file) {
            debug!("Using local model file {}", path.display());
            return Ok(path);
        }

        let cached = self.cache_path(repo_id, file);
        if tokio::fs::try_exists(&cached).await? {
            debug!("Using cached model file {}", cached.display());
            return Ok(cached);
        }

        self.download(repo_id, file, &cached).await?;
        Ok(cached)
    }

    async fn download(&self, repo_id: &str, file: &str, destination: &Path) -> Result<()> {
        let url = self.file_url(repo_id, file);
        info!("Downloading {}", url);

        let mut request = self.client.get(&url);
        if let Some(token) = &self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let mut response = request.send().await.map_err(|e| TranslationError::NetworkError {
            message: e.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let error_code = response
                .headers()
                .get("x-error-code")
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string();

            // The hub answers 401 rather than 404 for repositories that do not exist
            if status_code == 401 || error_code == "RepoNotFound" {
                warn!("Repository {} not found (HTTP {})", repo_id, status_code);
                return Err(TranslationError::ModelNotFound {
                    model_id: repo_id.to_string(),
                });
            }
            if status_code == 404 {
                warn!("{} not found in {}", file, repo_id);
                return Err(TranslationError::ArtifactNotFound {
                    model_id: repo_id.to_string(),
                    file: file.to_string(),
                });
            }
            let message = response.text().await.unwrap_or_default();
            return Err(TranslationError::ApiError {
                status: status_code,
                message,
            });
        }

        let parent = destination.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        // Unique per download; the rename into place is atomic
        let (partial, partial_path) = tempfile::Builder::new()
            .prefix(".download-")
            .suffix(".partial")
            .tempfile_in(parent)?
            .into_parts();
        let mut out = tokio::fs::File::from_std(partial);
        let progress = self.progress_bar(file, response.content_length());
        let mut written: u64 = 0;

        while let Some(chunk) = response.chunk().await.map_err(|e| TranslationError::NetworkError {
            message: e.to_string(),
        })? {
            out.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(pb) = &progress {
                pb.set_position(written);
            }
        }

        out.flush().await?;
        drop(out);
        partial_path.persist(destination).map_err(|e| e.error)?;

        if let Some(pb) = progress {
            pb.finish_with_message(format!("{} done", file));
        }

        info!("Saved {} ({} bytes) to {}", file, written, destination.display());
        Ok(())
    }

    fn progress_bar(&self, file: &str, total: Option<u64>) -> Option<ProgressBar> {
        if !self.show_progress {
            return None;
        }

        let pb = ProgressBar::new(total.unwrap_or(0));
        if let Ok(style) = ProgressStyle::default_bar().template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
        ) {
            pb.set_style(style.progress_chars("=>-"));
        }
        pb.set_message(file.to_string());
        Some(pb)
    }
}
