//! Storage fetchers
//!
//! A [`BlobFetcher`] turns a configured [`SourceReference`] into a stream of
//! byte chunks. Nothing here retries; a failure to open the source or a
//! failure mid-stream is reported as a [`FetchError`] and the run ends.

use async_trait::async_trait;
use bytes::Bytes;
use exlib_common::ExlibError;
use futures::stream::{self, BoxStream, StreamExt};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument};

use crate::storage::{Storage, StorageError};

pub type ByteStream = BoxStream<'static, Result<Bytes, FetchError>>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("Source not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Invalid source reference: {0}")]
    InvalidReference(String),
}

impl From<StorageError> for FetchError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound { .. } => FetchError::NotFound(err.to_string()),
            StorageError::Request(msg) => FetchError::Transport(msg),
        }
    }
}

/// Where the dataset lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceReference {
    /// Object key in the configured bucket
    S3 { key: String },
    Http { url: String },
    File { path: PathBuf },
}

impl std::str::FromStr for SourceReference {
    type Err = ExlibError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(key) = s.strip_prefix("s3://") {
            let key = key.trim_start_matches('/');
            if key.is_empty() {
                return Err(ExlibError::InvalidSource(format!("{s}: missing object key")));
            }
            Ok(SourceReference::S3 {
                key: key.to_string(),
            })
        } else if s.starts_with("http://") || s.starts_with("https://") {
            Ok(SourceReference::Http { url: s.to_string() })
        } else if let Some(path) = s.strip_prefix("file://") {
            if path.is_empty() {
                return Err(ExlibError::InvalidSource(format!("{s}: missing path")));
            }
            Ok(SourceReference::File {
                path: PathBuf::from(path),
            })
        } else {
            Err(ExlibError::InvalidSource(format!(
                "{s}: expected s3://, http(s):// or file://"
            )))
        }
    }
}

impl std::fmt::Display for SourceReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceReference::S3 { key } => write!(f, "s3://{key}"),
            SourceReference::Http { url } => f.write_str(url),
            SourceReference::File { path } => write!(f, "file://{}", path.display()),
        }
    }
}

#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, source: &SourceReference) -> Result<ByteStream, FetchError>;
}

/// Streams a response body over HTTP(S)
#[derive(Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(concat!("exlib/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    #[instrument(skip(self))]
    pub async fn fetch_url(&self, url: &str) -> Result<ByteStream, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            return Err(FetchError::Transport(format!("HTTP {status} from {url}")));
        }

        debug!(content_length = ?response.content_length(), "Response stream opened");

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| FetchError::Transport(e.to_string())))
            .boxed())
    }
}

/// Reads a local file in chunks
pub async fn fetch_file(path: &std::path::Path) -> Result<ByteStream, FetchError> {
    let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => FetchError::NotFound(path.display().to_string()),
        _ => FetchError::Transport(format!("{}: {e}", path.display())),
    })?;

    Ok(ReaderStream::new(file)
        .map(|chunk| chunk.map_err(|e| FetchError::Transport(e.to_string())))
        .boxed())
}

/// Adapts an S3 object body into a chunk stream
pub async fn fetch_object(storage: &Storage, key: &str) -> Result<ByteStream, FetchError> {
    let body = storage.download_stream(key).await?;

    Ok(stream::unfold(body, |mut body| async move {
        body.next()
            .await
            .map(|chunk| (chunk.map_err(|e| FetchError::Transport(e.to_string())), body))
    })
    .boxed())
}

/// Default fetcher: routes each reference to the matching backend
#[derive(Clone)]
pub struct SourceFetcher {
    storage: Option<Storage>,
    http: HttpFetcher,
}

impl SourceFetcher {
    pub fn new(storage: Option<Storage>, http: HttpFetcher) -> Self {
        Self { storage, http }
    }
}

#[async_trait]
impl BlobFetcher for SourceFetcher {
    #[instrument(skip(self), fields(source = %source))]
    async fn fetch(&self, source: &SourceReference) -> Result<ByteStream, FetchError> {
        match source {
            SourceReference::S3 { key } => {
                let storage = self.storage.as_ref().ok_or_else(|| {
                    FetchError::InvalidReference(format!(
                        "{source}: no S3 storage configured (set S3_BUCKET)"
                    ))
                })?;
                fetch_object(storage, key).await
            },
            SourceReference::Http { url } => self.http.fetch_url(url).await,
            SourceReference::File { path } => fetch_file(path).await,
        }
    }
}
