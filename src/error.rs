// src/error.rs

use std::path::PathBuf;

use crate::pipeline::RunState;

/// Failure of the transform step. Surfaces to the sequencer as `TransformFailed`.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("source {url} is unreachable: {source}")]
    SourceUnreachable {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("source file is empty, no header row found")]
    EmptySource,

    #[error("column to remove `{0}` is not in the source header")]
    MissingColumnToRemove(String),

    #[error("rename source column `{0}` is not in the source header")]
    MissingRenameSource(String),

    #[error("source column `{0}` has no rename mapping")]
    UnmappedColumn(String),

    #[error("source header repeats column `{0}`")]
    DuplicateColumn(String),

    #[error("malformed source row {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("invalid transform spec: {0}")]
    InvalidSpec(#[from] ConfigError),

    #[error("container did not start within {0:?}")]
    StartupTimeout(std::time::Duration),

    #[error("container exited with {0}")]
    ContainerExited(String),

    #[error("upload to {uri} failed: {source}")]
    Upload {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl TransformError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Failure of the load step. Surfaces to the sequencer as `LoadFailed`.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("source object {uri} unavailable: {source}")]
    SourceUnavailable {
        uri: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("header does not match schema: expected {expected:?}, found {found:?}")]
    SchemaMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("malformed row {line}: {reason}")]
    MalformedRow { line: u64, reason: String },

    #[error("row {line}: value {value:?} for `{field}` is not a valid {ty}")]
    Coercion {
        line: u64,
        field: String,
        ty: String,
        value: String,
    },

    #[error("row {line}: required field `{field}` is empty")]
    NullInRequired { line: u64, field: String },

    #[error("table {0} already has rows and the write disposition is WRITE_EMPTY")]
    TableNotEmpty(String),

    #[error("invalid table identifier `{0}`, expected `dataset.table`")]
    InvalidTable(String),

    #[error("warehouse rejected load job: {0}")]
    Rejected(String),

    #[error("warehouse unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
}

/// Configuration that fails validation before anything runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading config {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("environment variable `{0}` is not set")]
    MissingVariable(String),

    #[error("environment variable `{name}` is not valid JSON: {source}")]
    BadJson {
        name: String,
        source: serde_json::Error,
    },

    #[error("invalid object URI `{0}`, expected gs://bucket/path")]
    InvalidUri(String),

    #[error("rename map and CSV headers disagree: {0}")]
    HeaderMismatch(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("{0}")]
    Invalid(String),

    #[error("backend `{0}` is not compiled in (enable the `gcp` feature)")]
    BackendUnavailable(String),
}

/// Anything that stops a pipeline from being defined or a run from finishing.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("TransformFailure: {0}")]
    Transform(#[from] TransformError),

    #[error("LoadFailure: {0}")]
    Load(#[from] LoadError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("pipeline {0} already has the maximum number of active runs")]
    RunInProgress(String),

    #[error("illegal run state transition {from:?} -> {to:?}")]
    InvalidTransition { from: RunState, to: RunState },
}
