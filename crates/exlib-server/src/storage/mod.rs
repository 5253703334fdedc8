//! S3-compatible object storage client

use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    operation::get_object::GetObjectError,
    primitives::ByteStream,
    Client,
};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub mod config;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("S3 request failed: {0}")]
    Request(String),
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub fn new(config: config::StorageConfig) -> Self {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            bucket = %config.bucket,
            "Initializing storage"
        );

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "exlib-storage",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Self {
            client,
            bucket: config.bucket,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Open an object body for streaming reads
    #[instrument(skip(self))]
    pub async fn download_stream(&self, key: &str) -> Result<ByteStream, StorageError> {
        debug!("Opening s3://{}/{}", self.bucket, key);

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|err| {
                let missing = matches!(err.as_service_error(), Some(GetObjectError::NoSuchKey(_)))
                    || err.raw_response().map(|r| r.status().as_u16()) == Some(404);
                if missing {
                    StorageError::NotFound {
                        bucket: self.bucket.clone(),
                        key: key.to_string(),
                    }
                } else {
                    StorageError::Request(DisplayErrorContext(&err).to_string())
                }
            })?;

        Ok(response.body)
    }
}
