use std::path::{Path, PathBuf};
use std::fs;
use std::io;
use std::sync::Arc;
use std::env;
use tokio::sync::Mutex;
use reqwest;
use sha2::{Sha256, Digest};
use dirs;
use log;

use crate::models::ModelInfo;

const MODEL_FILE_NAME: &str = "model.onnx";

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model not downloaded: {0}")]
    NotDownloaded(String),
    #[error("Download error: {0}")]
    DownloadError(#[from] reqwest::Error),
    #[error("Download of {url} failed with status {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Model verification failed")]
    VerificationFailed,
    #[error("Hash mismatch: expected {expected}, got {actual} for {name}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },
}

/// Downloads and caches feature-extractor weights on local disk.
#[derive(Clone, Debug)]
pub struct ModelManager {
    models_dir: PathBuf,
    download_lock: Arc<Mutex<()>>,
}

impl ModelManager {
    /// Creates a new ModelManager with the default models directory
    pub fn new_default() -> io::Result<Self> {
        Self::new(Self::get_default_models_dir())
    }

    /// Returns the default models directory path
    pub fn get_default_models_dir() -> PathBuf {
        if let Ok(path) = env::var("GLIMPSE_CACHE") {
            return PathBuf::from(path).join("models");
        }

        if let Some(cache_dir) = dirs::cache_dir() {
            return cache_dir.join("glimpse").join("models");
        }

        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(".cache").join("glimpse").join("models");
        }

        env::temp_dir().join("glimpse").join("models")
    }

    pub fn new<P: AsRef<Path>>(models_dir: P) -> io::Result<Self> {
        let models_dir = models_dir.as_ref().to_path_buf();
        fs::create_dir_all(&models_dir)?;
        Ok(Self {
            models_dir,
            download_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn get_model_path(&self, name: &str) -> PathBuf {
        self.models_dir.join(name).join(MODEL_FILE_NAME)
    }

    pub fn is_model_downloaded(&self, name: &str) -> bool {
        let model_path = self.get_model_path(name);
        log::debug!("Model path: {:?} (exists: {})", model_path, model_path.exists());
        model_path.exists()
    }

    /// Fetches the model file unless a verified copy is already cached.
    pub async fn download_model(&self, info: &ModelInfo) -> Result<(), ModelError> {
        let _lock = self.download_lock.lock().await;

        let model_dir = self.models_dir.join(&info.name);
        log::info!("Creating model directory at {:?}", model_dir);
        fs::create_dir_all(&model_dir)?;

        let model_path = self.get_model_path(&info.name);
        let result = if model_path.exists() {
            log::info!("Model file exists at {:?}, verifying...", model_path);
            if self.verify_file(&model_path, info.model_hash.as_deref())? {
                log::info!("Existing model file verified successfully");
                Ok(())
            } else {
                log::warn!("Model file verification failed, redownloading");
                self.download_and_verify_file(info, &model_path).await
            }
        } else {
            log::info!("Model file does not exist, downloading...");
            self.download_and_verify_file(info, &model_path).await
        };

        if let Err(e) = &result {
            log::error!("Failed to set up model '{}': {}", info.name, e);
            let _ = self.remove_download(&info.name);
        }
        result
    }

    fn file_hash(path: &Path) -> Result<String, ModelError> {
        let bytes = fs::read(path)?;
        Ok(Self::hash_bytes(&bytes))
    }

    fn hash_bytes(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Files without a published hash only need to exist.
    fn verify_file(&self, path: &Path, expected_hash: Option<&str>) -> Result<bool, ModelError> {
        if !path.exists() {
            return Ok(false);
        }
        match expected_hash {
            Some(expected) => {
                let hash = Self::file_hash(path)?;
                log::debug!("Calculated hash: {}", hash);
                log::debug!("Expected hash:   {}", expected);
                Ok(hash == expected)
            }
            None => {
                log::debug!("No published hash for {:?}, accepting existing file", path);
                Ok(true)
            }
        }
    }

    pub fn verify_model(&self, info: &ModelInfo) -> Result<bool, ModelError> {
        let model_path = self.get_model_path(&info.name);
        let verified = self.verify_file(&model_path, info.model_hash.as_deref())?;
        log::info!("Model '{}' verification: {}", info.name, verified);
        Ok(verified)
    }

    async fn download_and_verify_file(&self, info: &ModelInfo, path: &Path) -> Result<(), ModelError> {
        log::info!("Downloading model '{}' from {} to {:?}", info.name, info.model_url, path);
        let response = reqwest::get(&info.model_url).await?;
        let status = response.status();
        log::info!("Download response status: {}", status);
        if !status.is_success() {
            return Err(ModelError::HttpStatus {
                url: info.model_url.clone(),
                status: status.as_u16(),
            });
        }
        let bytes = response.bytes().await?;
        log::info!("Downloaded {} bytes", bytes.len());

        let hash = Self::hash_bytes(&bytes);
        match &info.model_hash {
            Some(expected) if *expected != hash => {
                log::error!("{} hash mismatch: expected {}, got {}", info.name, expected, hash);
                return Err(ModelError::HashMismatch {
                    name: info.name.clone(),
                    expected: expected.clone(),
                    actual: hash,
                });
            }
            Some(_) => {}
            None => log::info!("Downloaded {} with sha256 {}", info.name, hash),
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &bytes)?;

        if !self.verify_file(path, info.model_hash.as_deref())? {
            return Err(ModelError::VerificationFailed);
        }

        log::info!("Model '{}' downloaded and verified successfully", info.name);
        Ok(())
    }

    pub fn remove_download(&self, name: &str) -> Result<(), ModelError> {
        let model_path = self.get_model_path(name);
        if model_path.exists() {
            fs::remove_file(&model_path)?;
        }
        Ok(())
    }

    /// Ensures that a model is downloaded and verified.
    /// If the model doesn't exist, it will be downloaded.
    /// If verification fails, it will be re-downloaded.
    pub async fn ensure_model_downloaded(&self, info: &ModelInfo) -> Result<PathBuf, ModelError> {
        log::info!("Checking if model {} is downloaded...", info.name);
        if !self.is_model_downloaded(&info.name) {
            log::info!("Model not found, downloading...");
            self.download_model(info).await?;
        } else if !self.verify_model(info)? {
            log::info!("Model verification failed, re-downloading...");
            self.remove_download(&info.name)?;
            self.download_model(info).await?;
        }
        Ok(self.get_model_path(&info.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_info(hash: Option<String>) -> ModelInfo {
        ModelInfo {
            name: "local".to_string(),
            model_url: "http://127.0.0.1:9/model.onnx".to_string(),
            model_hash: hash,
        }
    }

    #[test]
    fn test_verify_with_hash() -> Result<(), ModelError> {
        let dir = tempfile::tempdir()?;
        let manager = ModelManager::new(dir.path())?;
        let path = manager.get_model_path("local");
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, b"weights")?;

        let good = local_info(Some(ModelManager::hash_bytes(b"weights")));
        assert!(manager.verify_model(&good)?);

        fs::write(&path, "corrupted data")?;
        assert!(!manager.verify_model(&good)?);
        Ok(())
    }

    #[test]
    fn test_verify_without_hash() -> Result<(), ModelError> {
        let dir = tempfile::tempdir()?;
        let manager = ModelManager::new(dir.path())?;
        let info = local_info(None);
        assert!(!manager.verify_model(&info)?);

        let path = manager.get_model_path("local");
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, b"anything")?;
        assert!(manager.verify_model(&info)?);
        Ok(())
    }

    #[tokio::test]
    async fn test_cached_model_skips_download() -> Result<(), ModelError> {
        let dir = tempfile::tempdir()?;
        let manager = ModelManager::new(dir.path())?;
        let path = manager.get_model_path("local");
        fs::create_dir_all(path.parent().unwrap())?;
        fs::write(&path, b"weights")?;

        // The URL is unreachable, so success proves no request was made.
        let info = local_info(Some(ModelManager::hash_bytes(b"weights")));
        let resolved = manager.ensure_model_downloaded(&info).await?;
        assert_eq!(resolved, path);
        Ok(())
    }

    #[test]
    fn test_default_models_dir() {
        env::set_var("GLIMPSE_CACHE", "/tmp/test-cache");
        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("/tmp/test-cache/models"));
        env::remove_var("GLIMPSE_CACHE");

        let path = ModelManager::get_default_models_dir();
        assert!(path.to_str().unwrap().contains("glimpse"));
    }
}
