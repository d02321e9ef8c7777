// src/core/dfs.rs

//! The distributed-filesystem seam.
//!
//! Every component that touches commit logs or metalogs goes through the
//! [`Dfs`] trait, so the storage backing (a broker for a real distributed
//! filesystem, or the bundled local-filesystem implementation) is pluggable.
//! Rename is atomic within a directory; append durability is only guaranteed
//! after an explicit `sync`.

use crate::core::TesseraError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// One directory entry as returned by `readdir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub length: u64,
    pub is_directory: bool,
}

#[async_trait]
pub trait Dfs: Send + Sync {
    /// Appends `data` to the file at `path`, creating it if needed.
    /// Returns the file length after the append.
    async fn append(&self, path: &str, data: Bytes) -> Result<u64, TesseraError>;

    /// Fsyncs the open append handle for `path`.
    async fn sync(&self, path: &str) -> Result<(), TesseraError>;

    /// Closes the open append handle for `path`, if any.
    async fn close(&self, path: &str) -> Result<(), TesseraError>;

    /// Reads the whole file.
    async fn read(&self, path: &str) -> Result<Bytes, TesseraError>;

    async fn length(&self, path: &str) -> Result<u64, TesseraError>;

    async fn exists(&self, path: &str) -> Result<bool, TesseraError>;

    async fn remove(&self, path: &str) -> Result<(), TesseraError>;

    /// Atomic within a directory.
    async fn rename(&self, from: &str, to: &str) -> Result<(), TesseraError>;

    async fn mkdirs(&self, path: &str) -> Result<(), TesseraError>;

    /// Removes a directory and everything below it.
    async fn rmdir(&self, path: &str) -> Result<(), TesseraError>;

    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, TesseraError>;
}

/// Local-filesystem implementation used by tests and single-node deployments.
/// Paths handed to the trait are rooted under `base_dir`.
pub struct LocalDfs {
    base_dir: PathBuf,
    // Open append handles, so sync() hits the same file descriptor the
    // appends went through.
    handles: DashMap<String, Arc<Mutex<tokio::fs::File>>>,
}

impl LocalDfs {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            handles: DashMap::new(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.base_dir.join(path.trim_start_matches('/'))
    }

    async fn handle(&self, path: &str) -> Result<Arc<Mutex<tokio::fs::File>>, TesseraError> {
        if let Some(handle) = self.handles.get(path) {
            return Ok(handle.clone());
        }
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&full)
            .await?;
        let handle = Arc::new(Mutex::new(file));
        self.handles.insert(path.to_string(), handle.clone());
        Ok(handle)
    }

    fn map_not_found(path: &str, e: std::io::Error) -> TesseraError {
        if e.kind() == ErrorKind::NotFound {
            TesseraError::FileNotFound(path.to_string())
        } else {
            e.into()
        }
    }
}

#[async_trait]
impl Dfs for LocalDfs {
    async fn append(&self, path: &str, data: Bytes) -> Result<u64, TesseraError> {
        let handle = self.handle(path).await?;
        let mut file = handle.lock().await;
        file.write_all(&data).await?;
        Ok(file.metadata().await?.len())
    }

    async fn sync(&self, path: &str) -> Result<(), TesseraError> {
        if let Some(handle) = self.handles.get(path) {
            let file = handle.lock().await;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn close(&self, path: &str) -> Result<(), TesseraError> {
        if let Some((_, handle)) = self.handles.remove(path) {
            let file = handle.lock().await;
            file.sync_all().await?;
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Bytes, TesseraError> {
        let full = self.resolve(path);
        match tokio::fs::read(&full).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) => Err(Self::map_not_found(path, e)),
        }
    }

    async fn length(&self, path: &str) -> Result<u64, TesseraError> {
        let full = self.resolve(path);
        match tokio::fs::metadata(&full).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) => Err(Self::map_not_found(path, e)),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool, TesseraError> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await?)
    }

    async fn remove(&self, path: &str) -> Result<(), TesseraError> {
        self.handles.remove(path);
        tokio::fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| Self::map_not_found(path, e))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TesseraError> {
        self.handles.remove(from);
        tokio::fs::rename(self.resolve(from), self.resolve(to))
            .await
            .map_err(|e| Self::map_not_found(from, e))
    }

    async fn mkdirs(&self, path: &str) -> Result<(), TesseraError> {
        tokio::fs::create_dir_all(self.resolve(path)).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), TesseraError> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.handles.retain(|p, _| !p.starts_with(&prefix));
        tokio::fs::remove_dir_all(self.resolve(path))
            .await
            .map_err(|e| Self::map_not_found(path, e))
    }

    async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, TesseraError> {
        let full = self.resolve(path);
        let mut reader = match tokio::fs::read_dir(&full).await {
            Ok(r) => r,
            Err(e) => return Err(Self::map_not_found(path, e)),
        };
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let meta = entry.metadata().await?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                length: meta.len(),
                is_directory: meta.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

/// Joins two DFS path components.
pub fn join(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Returns the parent directory of a DFS path.
pub fn dirname(path: &str) -> &str {
    Path::new(path)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("")
}

/// Returns the final component of a DFS path.
pub fn basename(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|p| p.to_str())
        .unwrap_or(path)
}
