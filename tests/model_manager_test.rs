use std::fs;

use glimpse::{BuiltinModel, ModelError, ModelInfo, ModelManager};
use sha2::{Digest, Sha256};

// Nothing listens on the discard port, so any download attempt fails fast.
const UNREACHABLE_URL: &str = "http://127.0.0.1:9/model.onnx";

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn seed_model(manager: &ModelManager, name: &str, bytes: &[u8]) -> std::io::Result<()> {
    let path = manager.get_model_path(name);
    fs::create_dir_all(path.parent().unwrap())?;
    fs::write(path, bytes)
}

#[tokio::test]
async fn test_cached_model_is_used_without_download() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    let info = ModelInfo {
        name: "cached".to_string(),
        model_url: UNREACHABLE_URL.to_string(),
        model_hash: Some(sha256_hex(b"weights")),
    };

    assert!(!manager.is_model_downloaded(&info.name));
    seed_model(&manager, &info.name, b"weights")?;
    assert!(manager.is_model_downloaded(&info.name));
    assert!(manager.verify_model(&info)?);

    let path = manager.ensure_model_downloaded(&info).await?;
    assert_eq!(path, manager.get_model_path(&info.name));
    assert_eq!(fs::read(path)?, b"weights");
    Ok(())
}

#[tokio::test]
async fn test_corrupt_model_is_refetched() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    let info = ModelInfo {
        name: "corrupt".to_string(),
        model_url: UNREACHABLE_URL.to_string(),
        model_hash: Some(sha256_hex(b"weights")),
    };
    seed_model(&manager, &info.name, b"truncated")?;
    assert!(!manager.verify_model(&info)?);

    let result = manager.ensure_model_downloaded(&info).await;
    assert!(matches!(result, Err(ModelError::DownloadError(_))));
    // A failed fetch leaves nothing half-written behind
    assert!(!manager.is_model_downloaded(&info.name));
    Ok(())
}

#[tokio::test]
async fn test_unpublished_hash_accepts_existing_file() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    let info = ModelInfo {
        name: "unhashed".to_string(),
        model_url: UNREACHABLE_URL.to_string(),
        model_hash: None,
    };

    assert!(!manager.verify_model(&info)?);
    seed_model(&manager, &info.name, b"anything")?;
    assert!(manager.verify_model(&info)?);
    manager.ensure_model_downloaded(&info).await?;
    Ok(())
}

#[test]
fn test_remove_download() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let manager = ModelManager::new(dir.path())?;
    seed_model(&manager, "stale", b"old")?;

    manager.remove_download("stale")?;
    assert!(!manager.is_model_downloaded("stale"));
    // Removing twice is fine
    manager.remove_download("stale")?;
    Ok(())
}

#[test]
fn test_builtin_model_layout() {
    let dir = tempfile::tempdir().unwrap();
    let manager = ModelManager::new(dir.path()).unwrap();
    let info = BuiltinModel::MobileNetV2.get_model_info();
    let path = manager.get_model_path(&info.name);
    assert!(path.starts_with(manager.models_dir()));
    assert!(path.ends_with("mobilenetv2/model.onnx"));
}
