// src/assemble.rs
//
// Turn a RunConfig into a runnable Pipeline: pick the object store and
// warehouse for the backend, then the transform flavour.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::{
    config::{BackendConfig, RunConfig, TransformMode},
    load::{LoadTask, LocalWarehouse, Warehouse},
    pipeline::Pipeline,
    storage::{LocalStore, ObjectStore},
    transform::{ContainerTransform, CsvTransform, TransformStep},
};

#[cfg(not(feature = "gcp"))]
use crate::error::ConfigError;

/// Object store and warehouse for a backend.
pub async fn backend(config: &BackendConfig) -> Result<(Arc<dyn ObjectStore>, Arc<dyn Warehouse>)> {
    match config {
        BackendConfig::Local { root } => {
            let store: Arc<dyn ObjectStore> = Arc::new(LocalStore::new(root.join("objects")));
            let warehouse = Arc::new(LocalWarehouse::new(root.join("warehouse"), store.clone()));
            info!(root = %root.display(), "using local backend");
            Ok((store, warehouse))
        }
        #[cfg(feature = "gcp")]
        BackendConfig::Gcp { project } => {
            let store = crate::storage::GcsStore::from_default_credentials()
                .await
                .context("connecting to GCS")?;
            let warehouse = crate::load::BigQueryWarehouse::from_default_credentials(project.clone())
                .await
                .context("connecting to BigQuery")?;
            info!(project = ?project, "using gcp backend");
            Ok((Arc::new(store), Arc::new(warehouse)))
        }
        #[cfg(not(feature = "gcp"))]
        BackendConfig::Gcp { .. } => Err(ConfigError::BackendUnavailable("gcp".into()).into()),
    }
}

pub async fn build_pipeline(config: &RunConfig) -> Result<Pipeline> {
    config.validate()?;
    let (store, warehouse) = backend(&config.backend).await?;

    let t = &config.transform;
    let spec = config.transform_spec();
    let transform: Arc<dyn TransformStep> = match t.mode {
        TransformMode::InProcess => Arc::new(CsvTransform::new(&t.task_id, spec, store)?),
        TransformMode::Container => Arc::new(
            ContainerTransform::new(&t.task_id, &t.name, &t.image, spec)?
                .with_pull_policy(t.pull_policy)
                .with_resources(t.resources.clone())
                .with_startup_timeout(t.startup_timeout())
                .with_runtime(&t.runtime),
        ),
    };

    let load = LoadTask::new(&config.load.task_id, config.load_job()?, warehouse);

    let pipeline = Pipeline::builder(&config.pipeline.id)
        .owner(&config.pipeline.owner)
        .schedule(config.pipeline.schedule.clone())
        .transform(transform)
        .load(load)
        .build()
        .with_context(|| format!("defining pipeline {}", config.pipeline.id))?;

    info!(
        pipeline = %pipeline.id(),
        mode = ?t.mode,
        edges = ?pipeline.edges(),
        "pipeline ready"
    );
    Ok(pipeline)
}
