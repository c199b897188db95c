// src/transform/mod.rs
//
// The first pipeline step: turn the raw feed into a CSV whose header is the
// table schema, and leave it in object storage for the load step.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::{
    error::{ConfigError, TransformError},
    pipeline::RunContext,
    schema::RenameMap,
    storage::{ObjectUri, SourceLocation},
};

pub mod container;
pub mod rewrite;

pub use self::container::{ContainerTransform, PullPolicy, Resources};
pub use self::rewrite::{rewrite_columns, CsvTransform};

pub const SOURCE_URL: &str = "SOURCE_URL";
pub const SOURCE_FILE: &str = "SOURCE_FILE";
pub const COLUMN_TO_REMOVE: &str = "COLUMN_TO_REMOVE";
pub const TARGET_FILE: &str = "TARGET_FILE";
pub const TARGET_GCS_BUCKET: &str = "TARGET_GCS_BUCKET";
pub const TARGET_GCS_PATH: &str = "TARGET_GCS_PATH";
pub const PIPELINE_NAME: &str = "PIPELINE_NAME";
pub const CSV_HEADERS: &str = "CSV_HEADERS";
pub const RENAME_MAPPINGS: &str = "RENAME_MAPPINGS";

/// Everything the transform program is told through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformSpec {
    pub source_url: String,
    pub source_file: PathBuf,
    pub column_to_remove: String,
    pub target_file: PathBuf,
    pub target_gcs_bucket: String,
    pub target_gcs_path: String,
    pub pipeline_name: String,
    pub csv_headers: Vec<String>,
    pub rename_mappings: RenameMap,
}

impl TransformSpec {
    /// Rename targets must be the CSV headers, in order, and locations must parse.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let targets: Vec<&str> = self.rename_mappings.targets().collect();
        if targets.len() != self.csv_headers.len()
            || targets.iter().zip(&self.csv_headers).any(|(t, h)| t != h)
        {
            return Err(ConfigError::HeaderMismatch(format!(
                "{} values {:?} differ from {} {:?}",
                RENAME_MAPPINGS, targets, CSV_HEADERS, self.csv_headers
            )));
        }
        if self.rename_mappings.contains_source(&self.column_to_remove) {
            return Err(ConfigError::HeaderMismatch(format!(
                "`{}` is both removed and renamed",
                self.column_to_remove
            )));
        }
        SourceLocation::parse(&self.source_url)?;
        self.target_uri()?;
        Ok(())
    }

    pub fn target_uri(&self) -> Result<ObjectUri, ConfigError> {
        if self.target_gcs_bucket.is_empty() || self.target_gcs_path.is_empty() {
            return Err(ConfigError::InvalidUri(format!(
                "gs://{}/{}",
                self.target_gcs_bucket, self.target_gcs_path
            )));
        }
        Ok(ObjectUri::new(
            self.target_gcs_bucket.clone(),
            self.target_gcs_path.clone(),
        ))
    }

    /// The fixed environment contract, in declaration order.
    pub fn to_env(&self) -> Result<Vec<(&'static str, String)>, ConfigError> {
        let headers =
            serde_json::to_string(&self.csv_headers).map_err(|source| ConfigError::BadJson {
                name: CSV_HEADERS.into(),
                source,
            })?;
        let renames =
            serde_json::to_string(&self.rename_mappings).map_err(|source| ConfigError::BadJson {
                name: RENAME_MAPPINGS.into(),
                source,
            })?;
        Ok(vec![
            (SOURCE_URL, self.source_url.clone()),
            (SOURCE_FILE, self.source_file.display().to_string()),
            (COLUMN_TO_REMOVE, self.column_to_remove.clone()),
            (TARGET_FILE, self.target_file.display().to_string()),
            (TARGET_GCS_BUCKET, self.target_gcs_bucket.clone()),
            (TARGET_GCS_PATH, self.target_gcs_path.clone()),
            (PIPELINE_NAME, self.pipeline_name.clone()),
            (CSV_HEADERS, headers),
            (RENAME_MAPPINGS, renames),
        ])
    }

    /// Rebuild a spec from the environment contract. `lookup` is usually `std::env::var(..).ok()`.
    pub fn from_env<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).ok_or_else(|| ConfigError::MissingVariable(name.into()));

        let csv_headers: Vec<String> =
            serde_json::from_str(&var(CSV_HEADERS)?).map_err(|source| ConfigError::BadJson {
                name: CSV_HEADERS.into(),
                source,
            })?;
        let rename_mappings: RenameMap = serde_json::from_str(&var(RENAME_MAPPINGS)?)
            .map_err(|source| ConfigError::BadJson {
                name: RENAME_MAPPINGS.into(),
                source,
            })?;

        let spec = TransformSpec {
            source_url: var(SOURCE_URL)?,
            source_file: PathBuf::from(var(SOURCE_FILE)?),
            column_to_remove: var(COLUMN_TO_REMOVE)?,
            target_file: PathBuf::from(var(TARGET_FILE)?),
            target_gcs_bucket: var(TARGET_GCS_BUCKET)?,
            target_gcs_path: var(TARGET_GCS_PATH)?,
            pipeline_name: var(PIPELINE_NAME)?,
            csv_headers,
            rename_mappings,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// What the transform step leaves behind for the load step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformOutput {
    pub object: ObjectUri,
    /// Data rows written; `None` when the work happened out of process.
    pub rows: Option<u64>,
}

#[async_trait]
pub trait TransformStep: Send + Sync {
    fn task_id(&self) -> &str;

    /// Header row of the CSV this step produces.
    fn output_headers(&self) -> &[String];

    /// Object the cleaned CSV is uploaded to.
    fn output_object(&self) -> &ObjectUri;

    async fn run(&self, ctx: &RunContext) -> Result<TransformOutput, TransformError>;
}
