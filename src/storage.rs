//! Blob storage for the data lake.
//!
//! The lake layout is fixed:
//!
//! ```text
//! bronze/{source}/{endpoint}/run_date=YYYY-MM-DD/data.jsonl
//! silver/{domain}/{table}/run_date=YYYY-MM-DD/part-*.parquet
//! gold/{domain}/{table}/run_date=YYYY-MM-DD/part-*.parquet
//! ```
//!
//! [`LocalBlobStore`] maps each container to a directory under a root;
//! [`MemoryBlobStore`] keeps everything in a map and is used in tests.

use std::collections::BTreeMap;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use globset::{GlobBuilder, GlobMatcher};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::error::{EtlError, Result};

/// Data lake layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Bronze,
    Silver,
    Gold,
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Bronze => write!(f, "bronze"),
            Layer::Silver => write!(f, "silver"),
            Layer::Gold => write!(f, "gold"),
        }
    }
}

/// `bronze/{source}/{endpoint}/run_date=YYYY-MM-DD/data.jsonl`
pub fn bronze_path(source: &str, endpoint: &str, run_date: NaiveDate) -> String {
    format!(
        "bronze/{}/{}/run_date={}/data.jsonl",
        source,
        endpoint,
        run_date.format("%Y-%m-%d")
    )
}

/// `{layer}/{domain}/{table}/run_date=YYYY-MM-DD/`
pub fn curated_prefix(layer: Layer, domain: &str, table: &str, run_date: NaiveDate) -> String {
    format!(
        "{}/{}/{}/run_date={}/",
        layer,
        domain,
        table,
        run_date.format("%Y-%m-%d")
    )
}

fn part_matcher() -> Result<GlobMatcher> {
    let glob = GlobBuilder::new("**/part-*.parquet")
        .literal_separator(true)
        .build()
        .map_err(|e| EtlError::Configuration(e.to_string()))?;
    Ok(glob.compile_matcher())
}

/// Keep only `part-*.parquet` files (skips `_SUCCESS`, `.crc` and the like).
pub fn part_files(paths: &[String]) -> Result<Vec<String>> {
    let matcher = part_matcher()?;
    Ok(paths
        .iter()
        .filter(|p| matcher.is_match(p.as_str()))
        .cloned()
        .collect())
}

/// Minimal object store contract.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `data` at `path`. Without `overwrite`, an existing blob is an
    /// `AlreadyExists` error.
    async fn put_bytes(&self, container: &str, path: &str, data: &[u8], overwrite: bool)
        -> Result<()>;

    async fn get_bytes(&self, container: &str, path: &str) -> Result<Vec<u8>>;

    /// Blob paths starting with `prefix`, sorted.
    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>>;

    async fn put_text(&self, container: &str, path: &str, text: &str, overwrite: bool) -> Result<()> {
        self.put_bytes(container, path, text.as_bytes(), overwrite)
            .await
    }

    async fn get_text(&self, container: &str, path: &str) -> Result<String> {
        let bytes = self.get_bytes(container, path).await?;
        String::from_utf8(bytes)
            .map_err(|e| EtlError::Storage(IoError::new(ErrorKind::InvalidData, e)))
    }
}

fn invalid_path(path: &str) -> EtlError {
    EtlError::Storage(IoError::new(
        ErrorKind::InvalidInput,
        format!("invalid blob path '{}'", path),
    ))
}

/// Reject empty, absolute and `..` paths.
fn check_blob_path(path: &str) -> Result<()> {
    if path.is_empty() || path.ends_with('/') {
        return Err(invalid_path(path));
    }
    let ok = Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(())
    } else {
        Err(invalid_path(path))
    }
}

/// Containers as directories under `root`.
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn container_dir(&self, container: &str) -> Result<PathBuf> {
        check_blob_path(container)?;
        Ok(self.root.join(container))
    }

    fn blob_file(&self, container: &str, path: &str) -> Result<PathBuf> {
        check_blob_path(path)?;
        Ok(self.container_dir(container)?.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put_bytes(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        let file = self.blob_file(container, path)?;
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let mut handle = options.open(&file).await?;
        handle.write_all(data).await?;
        handle.flush().await?;
        Ok(())
    }

    async fn get_bytes(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let file = self.blob_file(container, path)?;
        Ok(tokio::fs::read(&file).await?)
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let dir = self.container_dir(container)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut paths = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(false) {
            let entry = entry.map_err(|e| EtlError::Storage(e.into()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&dir) else {
                continue;
            };
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                paths.push(key);
            }
        }
        paths.sort();
        Ok(paths)
    }
}

/// In-process store keyed by `(container, path)`.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<(String, String), Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> EtlError {
    EtlError::Storage(IoError::other("memory blob store lock poisoned"))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put_bytes(
        &self,
        container: &str,
        path: &str,
        data: &[u8],
        overwrite: bool,
    ) -> Result<()> {
        check_blob_path(path)?;
        let key = (container.to_string(), path.to_string());
        let mut blobs = self.blobs.write().map_err(poisoned)?;
        if !overwrite && blobs.contains_key(&key) {
            return Err(EtlError::Storage(IoError::new(
                ErrorKind::AlreadyExists,
                format!("blob exists: {}/{}", container, path),
            )));
        }
        blobs.insert(key, data.to_vec());
        Ok(())
    }

    async fn get_bytes(&self, container: &str, path: &str) -> Result<Vec<u8>> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        blobs
            .get(&(container.to_string(), path.to_string()))
            .cloned()
            .ok_or_else(|| {
                EtlError::Storage(IoError::new(
                    ErrorKind::NotFound,
                    format!("no blob at {}/{}", container, path),
                ))
            })
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<String>> {
        let blobs = self.blobs.read().map_err(poisoned)?;
        Ok(blobs
            .keys()
            .filter(|(c, p)| c == container && p.starts_with(prefix))
            .map(|(_, p)| p.clone())
            .collect())
    }
}
