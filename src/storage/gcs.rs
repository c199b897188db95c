// src/storage/gcs.rs

use anyhow::{Context, Result};
use async_trait::async_trait;
use google_cloud_storage::{
    client::{Client, ClientConfig},
    http::objects::{
        download::Range,
        get::GetObjectRequest,
        upload::{Media, UploadObjectRequest, UploadType},
    },
};
use tracing::info;

use super::{ObjectStore, ObjectUri};

/// Google Cloud Storage, authenticated with application default credentials.
pub struct GcsStore {
    client: Client,
}

impl GcsStore {
    pub async fn from_default_credentials() -> Result<Self> {
        let config = ClientConfig::default()
            .with_auth()
            .await
            .context("authenticating GCS client")?;
        Ok(Self {
            client: Client::new(config),
        })
    }
}

#[async_trait]
impl ObjectStore for GcsStore {
    async fn get(&self, uri: &ObjectUri) -> Result<Vec<u8>> {
        let request = GetObjectRequest {
            bucket: uri.bucket.clone(),
            object: uri.path.clone(),
            ..Default::default()
        };
        self.client
            .download_object(&request, &Range::default())
            .await
            .with_context(|| format!("downloading {}", uri))
    }

    async fn put(&self, uri: &ObjectUri, data: Vec<u8>) -> Result<()> {
        let len = data.len();
        let upload_type = UploadType::Simple(Media::new(uri.path.clone()));
        let request = UploadObjectRequest {
            bucket: uri.bucket.clone(),
            ..Default::default()
        };

        self.client
            .upload_object(&request, data, &upload_type)
            .await
            .with_context(|| format!("Failed to upload {} to GCS bucket {}", uri.path, uri.bucket))?;

        info!(object = %uri, bytes = len, "Uploaded to GCS");
        Ok(())
    }
}
