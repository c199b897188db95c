// src/load/mod.rs
//
// The second pipeline step: bulk-load the cleaned CSV into a warehouse table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};
use tracing::{info, instrument};

use crate::{
    error::LoadError, pipeline::RunContext, schema::TargetSchema, storage::ObjectUri,
};

pub mod local;

#[cfg(feature = "gcp")]
pub mod bigquery;

#[cfg(feature = "gcp")]
pub use bigquery::BigQueryWarehouse;
pub use local::LocalWarehouse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WriteDisposition {
    /// Discard existing rows, then write.
    #[default]
    WriteTruncate,
    WriteAppend,
    /// Fail unless the table is empty or missing.
    WriteEmpty,
}

/// `[project.]dataset.table`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub project: Option<String>,
    pub dataset: String,
    pub table: String,
}

impl FromStr for TableId {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(LoadError::InvalidTable(s.to_string()));
        }
        match parts.as_slice() {
            [dataset, table] => Ok(TableId {
                project: None,
                dataset: dataset.to_string(),
                table: table.to_string(),
            }),
            [project, dataset, table] => Ok(TableId {
                project: Some(project.to_string()),
                dataset: dataset.to_string(),
                table: table.to_string(),
            }),
            _ => Err(LoadError::InvalidTable(s.to_string())),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.project {
            Some(project) => write!(f, "{}.{}.{}", project, self.dataset, self.table),
            None => write!(f, "{}.{}", self.dataset, self.table),
        }
    }
}

/// A CSV bulk load: which objects, into which table, with which schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadJob {
    pub source_uris: Vec<ObjectUri>,
    pub destination: TableId,
    pub schema: TargetSchema,
    pub write_disposition: WriteDisposition,
    pub skip_leading_rows: u64,
    pub allow_quoted_newlines: bool,
}

impl LoadJob {
    /// Truncate-replace, one header row, quoted newlines allowed.
    pub fn csv(source: ObjectUri, destination: TableId, schema: TargetSchema) -> Self {
        Self {
            source_uris: vec![source],
            destination,
            schema,
            write_disposition: WriteDisposition::WriteTruncate,
            skip_leading_rows: 1,
            allow_quoted_newlines: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub table: TableId,
    /// Rows written by this load, when the warehouse reports it.
    pub rows_loaded: Option<u64>,
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    async fn load(&self, job: &LoadJob) -> Result<LoadSummary, LoadError>;
}

/// The load step as the pipeline sees it: a fixed job against a warehouse.
#[derive(Clone)]
pub struct LoadTask {
    task_id: String,
    job: LoadJob,
    warehouse: Arc<dyn Warehouse>,
}

impl LoadTask {
    pub fn new(task_id: impl Into<String>, job: LoadJob, warehouse: Arc<dyn Warehouse>) -> Self {
        Self {
            task_id: task_id.into(),
            job,
            warehouse,
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn job(&self) -> &LoadJob {
        &self.job
    }

    #[instrument(level = "info", skip(self, ctx), fields(task = %self.task_id, run_id = %ctx.run_id))]
    pub async fn run(&self, ctx: &RunContext) -> Result<LoadSummary, LoadError> {
        let summary = self.warehouse.load(&self.job).await?;
        info!(
            table = %summary.table,
            rows = ?summary.rows_loaded,
            disposition = ?self.job.write_disposition,
            "load complete"
        );
        Ok(summary)
    }
}

impl fmt::Debug for LoadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadTask")
            .field("task_id", &self.task_id)
            .field("job", &self.job)
            .finish_non_exhaustive()
    }
}
