use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ResolvedConfig;
use crate::error::JoinError;

/// Named blobs loaded and written wholesale.
pub trait CacheStore {
    fn exists(&self, name: &str) -> bool;
    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, JoinError>;
    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), JoinError>;
}

#[derive(Debug, Clone)]
pub struct Store {
    cache_root: Utf8PathBuf,
    download_root: Utf8PathBuf,
}

impl Store {
    pub fn new(config: &ResolvedConfig) -> Self {
        Self::new_with_paths(config.cache_root.clone(), config.download_root.clone())
    }

    pub fn new_with_paths(cache_root: Utf8PathBuf, download_root: Utf8PathBuf) -> Self {
        Self {
            cache_root,
            download_root,
        }
    }

    pub fn cache_path(&self, name: &str) -> Utf8PathBuf {
        self.cache_root.join(format!("{name}.json"))
    }

    pub fn ensure_cache_root(&self) -> Result<(), JoinError> {
        fs::create_dir_all(self.cache_root.as_std_path())
            .map_err(|err| JoinError::Filesystem(err.to_string()))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), JoinError> {
        let parent = path
            .parent()
            .ok_or_else(|| JoinError::Filesystem(format!("invalid cache path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| JoinError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix("scirex-join-cache")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| JoinError::Filesystem(err.to_string()))?;
        fs::write(temp.path(), content).map_err(|err| JoinError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| JoinError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

impl CacheStore for Store {
    fn exists(&self, name: &str) -> bool {
        self.cache_path(name).as_std_path().exists()
    }

    fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, JoinError> {
        let path = self.cache_path(name);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read(path.as_std_path())
            .map_err(|err| JoinError::Filesystem(format!("read {path}: {err}")))?;
        let value = serde_json::from_slice(&content).map_err(|err| JoinError::CacheDecode {
            name: name.to_string(),
            message: err.to_string(),
        })?;
        Ok(Some(value))
    }

    fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), JoinError> {
        let content =
            serde_json::to_vec_pretty(value).map_err(|err| JoinError::CacheDecode {
                name: name.to_string(),
                message: err.to_string(),
            })?;
        Self::write_bytes_atomic(&self.cache_path(name), &content)
    }
}
