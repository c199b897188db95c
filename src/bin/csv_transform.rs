// src/bin/csv_transform.rs
//
// Entry point of the transform image. Everything comes from the environment
// contract (SOURCE_URL .. RENAME_MAPPINGS); exits non-zero on any failure.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};
use wdi_pipeline::{
    storage::ObjectStore,
    transform::{CsvTransform, TransformSpec},
};

/// Object store for `gs://` sources and the upload target.
#[cfg(feature = "gcp")]
async fn object_store() -> Result<Arc<dyn ObjectStore>> {
    let store = wdi_pipeline::storage::GcsStore::from_default_credentials().await?;
    Ok(Arc::new(store))
}

/// Without GCS, objects live under `LOCAL_OBJECT_ROOT` (default `data/objects`).
#[cfg(not(feature = "gcp"))]
async fn object_store() -> Result<Arc<dyn ObjectStore>> {
    let root = std::env::var("LOCAL_OBJECT_ROOT").unwrap_or_else(|_| "data/objects".to_string());
    info!(root = %root, "using local object store");
    Ok(Arc::new(wdi_pipeline::storage::LocalStore::new(root)))
}

#[tokio::main]
async fn main() -> Result<()> {
    fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let spec = TransformSpec::from_env(|name| std::env::var(name).ok())
        .context("reading transform environment")?;
    info!(
        pipeline = %spec.pipeline_name,
        source = %spec.source_url,
        remove = %spec.column_to_remove,
        "starting transform"
    );

    let store = object_store().await?;
    let transform = CsvTransform::new(spec.pipeline_name.clone(), spec, store)?;
    let output = transform.execute().await?;

    info!(object = %output.object, rows = ?output.rows, "done");
    Ok(())
}
