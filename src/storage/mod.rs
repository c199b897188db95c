// src/storage/mod.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};
use url::Url;

use crate::error::ConfigError;

#[cfg(feature = "gcp")]
pub mod gcs;

#[cfg(feature = "gcp")]
pub use gcs::GcsStore;

/// `gs://bucket/path`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectUri {
    pub bucket: String,
    pub path: String,
}

impl ObjectUri {
    pub fn new(bucket: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            path: path.into().trim_start_matches('/').to_string(),
        }
    }
}

impl FromStr for ObjectUri {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix("gs://")
            .ok_or_else(|| ConfigError::InvalidUri(s.to_string()))?;
        match rest.split_once('/') {
            Some((bucket, path)) if !bucket.is_empty() && !path.is_empty() => {
                Ok(ObjectUri::new(bucket, path))
            }
            _ => Err(ConfigError::InvalidUri(s.to_string())),
        }
    }
}

impl fmt::Display for ObjectUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gs://{}/{}", self.bucket, self.path)
    }
}

/// Where a transform reads its source from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    Object(ObjectUri),
    Http(Url),
    File(PathBuf),
}

impl SourceLocation {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        if raw.starts_with("gs://") {
            return raw.parse().map(SourceLocation::Object);
        }
        match Url::parse(raw) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {
                Ok(SourceLocation::Http(url))
            }
            Ok(url) if url.scheme() == "file" => url
                .to_file_path()
                .map(SourceLocation::File)
                .map_err(|_| ConfigError::InvalidUri(raw.to_string())),
            // Bare paths, including Windows drive letters that parse as a scheme.
            _ => Ok(SourceLocation::File(PathBuf::from(raw))),
        }
    }
}

/// Minimal blob store: whole-object reads and writes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>>;
    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<()>;
}

/// Object store rooted in a local directory: `gs://b/p` lives at `<root>/b/p`.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_of(&self, uri: &ObjectUri) -> PathBuf {
        self.root.join(&uri.bucket).join(&uri.path)
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>> {
        let path = self.path_of(uri);
        fs::read(&path)
            .await
            .with_context(|| format!("reading {} from {}", uri, path.display()))
    }

    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<()> {
        let path = self.path_of(uri);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        // write to tmp, then rename over the object
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &data)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("renaming {} -> {}", tmp.display(), path.display()))?;
        debug!(object = %uri, bytes = data.len(), "stored object locally");
        Ok(())
    }
}

/// Copy `source` to `dest`, returning the number of bytes written.
pub async fn fetch_to_file(
    store: &dyn ObjectStore,
    source: &SourceLocation,
    dest: &Path,
) -> Result<u64> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating staging directory {}", parent.display()))?;
    }

    let bytes = match source {
        SourceLocation::Object(uri) => {
            let data = store.get(uri).await?;
            fs::write(dest, &data)
                .await
                .with_context(|| format!("writing {}", dest.display()))?;
            data.len() as u64
        }
        SourceLocation::Http(url) => download(url, dest).await?,
        SourceLocation::File(path) => fs::copy(path, dest)
            .await
            .with_context(|| format!("copying {} -> {}", path.display(), dest.display()))?,
    };

    info!(dest = %dest.display(), bytes, "fetched source");
    Ok(bytes)
}

async fn download(url: &Url, dest: &Path) -> Result<u64> {
    let client = Client::new();
    let response = client
        .get(url.as_str())
        .send()
        .await
        .with_context(|| format!("GET {}", url))?
        .error_for_status()
        .with_context(|| format!("GET {}", url))?;

    let mut file = fs::File::create(dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;
    let mut stream = response.bytes_stream();
    let mut total = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.with_context(|| format!("reading body from {}", url))?;
        file.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(total)
}
