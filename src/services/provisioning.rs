// Model provisioning - makes sure model files exist in MODEL_DIR before
// the models load, downloading missing ones from MODEL_BASE_URL

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::core::config::ProvisioningConfig;
use crate::core::errors::ProvisioningError;

pub struct ModelProvisioner {
    model_dir: PathBuf,
    base_url: Option<String>,
    client: reqwest::Client,
}

impl ModelProvisioner {
    pub fn new(config: &ProvisioningConfig) -> Result<Self, ProvisioningError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.download_timeout_secs))
            .build()
            .map_err(|e| ProvisioningError::DownloadFailed {
                url: config.model_base_url.clone().unwrap_or_default(),
                message: e.to_string(),
            })?;

        Ok(Self {
            model_dir: config.model_dir.clone(),
            base_url: config.model_base_url.clone(),
            client,
        })
    }

    /// Ensure every named file exists in the model directory.
    ///
    /// Present files are left alone. Returns the full paths in input order.
    pub async fn ensure_models(&self, files: &[String]) -> Result<Vec<PathBuf>, ProvisioningError> {
        tokio::fs::create_dir_all(&self.model_dir)
            .await
            .map_err(|source| ProvisioningError::Io {
                path: self.model_dir.display().to_string(),
                source,
            })?;

        let mut paths = Vec::with_capacity(files.len());
        for file in files {
            let path = self.model_dir.join(file);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                debug!("Model file present: {}", path.display());
            } else {
                self.download(file, &path).await?;
            }
            paths.push(path);
        }
        Ok(paths)
    }

    fn file_url(&self, file: &str, path: &Path) -> Result<String, ProvisioningError> {
        let base = self.base_url.as_deref().ok_or_else(|| ProvisioningError::Missing {
            path: path.display().to_string(),
        })?;

        // Treat the base as a directory so join appends instead of replacing
        let base = if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        };

        Url::parse(&base)
            .and_then(|b| b.join(file))
            .map(String::from)
            .map_err(|e| ProvisioningError::DownloadFailed {
                url: base.clone(),
                message: e.to_string(),
            })
    }

    async fn download(&self, file: &str, path: &Path) -> Result<(), ProvisioningError> {
        let url = self.file_url(file, path)?;
        info!("Downloading model '{}' from {}...", file, url);

        let failed = |e: reqwest::Error| ProvisioningError::DownloadFailed {
            url: url.clone(),
            message: e.to_string(),
        };

        let mut response = self.client.get(&url).send().await.map_err(failed)?;
        if !response.status().is_success() {
            return Err(ProvisioningError::HttpStatus {
                url: url.clone(),
                status: response.status().as_u16(),
            });
        }

        let io_err = |source: std::io::Error| ProvisioningError::Io {
            path: path.display().to_string(),
            source,
        };

        // Write next to the target and rename so a partial download never looks complete
        let part_path = partial_path(path);
        let mut out = tokio::fs::File::create(&part_path).await.map_err(io_err)?;
        let mut written = 0usize;
        let copy_result = async {
            while let Some(chunk) = response.chunk().await.map_err(failed)? {
                out.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len();
            }
            out.flush().await.map_err(io_err)?;
            Ok::<(), ProvisioningError>(())
        }
        .await;

        if let Err(e) = copy_result {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e);
        }
        drop(out);

        tokio::fs::rename(&part_path, path).await.map_err(io_err)?;
        info!(
            "✓ Downloaded model '{}' ({:.1} MB)",
            file,
            written as f64 / 1_048_576.0
        );
        Ok(())
    }
}

/// `<file name>.part` next to `path`, unique per target file
fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}
